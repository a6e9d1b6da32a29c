// Parse entry points and diagnostics.
//
// The generated parser reports positions as byte offsets; everything
// user-facing goes through here so errors carry line and column plus
// a hint for the mistakes people actually make.

use lalrpop_util::ParseError;

use crate::ast;
use crate::error::{EngineResult, JoshError};
use crate::grammar;
use crate::lexer::{line_col, LexError, Lexer, Tok};

/// Parse a whole Josh script.
pub fn parse_program(source: &str) -> EngineResult<ast::Program> {
    grammar::ProgramParser::new()
        .parse(Lexer::new(source))
        .map_err(|e| diagnose(source, e))
}

/// Parse a single expression (used by tests and the config layer).
pub fn parse_expression(source: &str) -> EngineResult<ast::Expr> {
    grammar::LineParser::new()
        .parse(Lexer::new(source))
        .map_err(|e| diagnose(source, e))
}

fn diagnose(source: &str, error: ParseError<usize, Tok, LexError>) -> JoshError {
    let (offset, message) = match error {
        ParseError::InvalidToken { location } => {
            (location, "invalid token".to_string())
        }
        ParseError::UnrecognizedEof { location, expected } => (
            location,
            format!("unexpected end of input{}", expectation(&expected)),
        ),
        ParseError::UnrecognizedToken {
            token: (start, tok, _),
            expected,
        } => {
            let mut message =
                format!("unexpected {}{}", tok, expectation(&expected));
            if let Some(hint) = guidance(&tok, &expected) {
                message.push_str("; ");
                message.push_str(hint);
            }
            (start, message)
        }
        ParseError::ExtraToken { token: (start, tok, _) } => {
            (start, format!("extra {} after a complete statement", tok))
        }
        ParseError::User { error } => (error.location, error.message),
    };
    let (line, col) = line_col(source, offset);
    JoshError::Parse { line, col, message }
}

fn expectation(expected: &[String]) -> String {
    if expected.is_empty() {
        String::new()
    } else if expected.len() <= 4 {
        format!(" (expected {})", expected.join(" or "))
    } else {
        format!(" (expected {}, ...)", expected[..4].join(" or "))
    }
}

// Hints for the common stumbles: forgotten '=', an event name that is
// not one of the reserved six, a handler before its stanza.
fn guidance(tok: &Tok, expected: &[String]) -> Option<&'static str> {
    let expects = |wanted: &str| expected.iter().any(|e| e.contains(wanted));
    match tok {
        Tok::Newline if expects("\"=\"") => {
            Some("handlers are written as 'attribute.event = expression'")
        }
        Tok::Ident(_) if expects("\"=\"") => {
            Some("a handler line takes a single '=' before its expression")
        }
        Tok::Assign if expects("newline") => {
            Some("only one '=' is allowed per handler line")
        }
        Tok::Int(_) | Tok::Decimal(_) if expects("ident") => {
            Some("unit names start with a letter; quote compound units like \"m / s\"")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use BinOp::*;

    fn assert_parses_to(text: &'static str, ast: Expr) {
        assert_eq!(parse_expression(text).unwrap(), ast);
    }

    fn int(v: i64) -> Expr {
        Expr::Scalar(Number::Int(v), None)
    }

    fn scalar(v: i64, unit: &str) -> Expr {
        Expr::Scalar(Number::Int(v), Some(String::from(unit)))
    }

    fn id(name: &str) -> Expr {
        Expr::Ident(String::from(name))
    }

    #[test]
    fn test_terms() {
        assert_parses_to("42", int(42));
        assert_parses_to("(42)", int(42));
        assert_parses_to("42 year", scalar(42, "year"));
        assert_parses_to("5 %", scalar(5, "%"));
        assert_parses_to("foo", id("foo"));
        assert_parses_to("prior.age", id("prior.age"));
        assert_parses_to("\"adult\"", Expr::Str(String::from("adult")));
    }

    #[test]
    fn test_precedence() {
        assert_parses_to(
            "3 + 4 * 2",
            bin(Add, int(3), bin(Mul, int(4), int(2))),
        );
        assert_parses_to(
            "3 + 4 < 3 * 4",
            bin(Lt, bin(Add, int(3), int(4)), bin(Mul, int(3), int(4))),
        );
        assert_parses_to(
            "2 ^ 3 ^ 2",
            bin(Pow, int(2), bin(Pow, int(3), int(2))),
        );
    }

    #[test]
    fn test_units_attach_to_literals() {
        assert_parses_to(
            "prior.age + 1 year",
            bin(Add, id("prior.age"), scalar(1, "year")),
        );
        assert_parses_to(
            "10 m / 2 s",
            bin(Div, scalar(10, "m"), scalar(2, "s")),
        );
    }

    #[test]
    fn test_cast() {
        assert_parses_to(
            "height as m",
            Expr::Cast {
                value: Node::new(id("height")),
                unit: String::from("m"),
                force: false,
            },
        );
        assert_parses_to(
            "height as! \"m / s\"",
            Expr::Cast {
                value: Node::new(id("height")),
                unit: String::from("m / s"),
                force: true,
            },
        );
    }

    #[test]
    fn test_ternary_and_if() {
        assert_parses_to(
            "x > 2 ? 1 : 0",
            Expr::Cond(
                vec![(
                    Node::new(bin(Gt, id("x"), int(2))),
                    Node::new(int(1)),
                )],
                Node::new(int(0)),
            ),
        );
        assert_parses_to(
            "if x > 2 { 1 } elif x > 1 { 2 } else { 3 }",
            Expr::Cond(
                vec![
                    (Node::new(bin(Gt, id("x"), int(2))), Node::new(int(1))),
                    (Node::new(bin(Gt, id("x"), int(1))), Node::new(int(2))),
                ],
                Node::new(int(3)),
            ),
        );
    }

    #[test]
    fn test_special_forms() {
        assert_parses_to(
            "limit x to [0, 10]",
            Expr::Limit {
                value: Node::new(id("x")),
                low: Node::new(int(0)),
                high: Node::new(int(10)),
            },
        );
        assert_parses_to(
            "sample uniform from 0 m to 1 m",
            Expr::Sample(SampleExpr::Uniform(
                Node::new(scalar(0, "m")),
                Node::new(scalar(1, "m")),
            )),
        );
        assert_parses_to(
            "sample 3 from ages with replacement",
            Expr::Sample(SampleExpr::Take {
                count: Node::new(int(3)),
                source: Node::new(id("ages")),
                with_replacement: true,
            }),
        );
        assert_parses_to(
            "create 10 count of ForeverTree",
            Expr::Create {
                count: Some(Node::new(scalar(10, "count"))),
                entity: String::from("ForeverTree"),
            },
        );
        assert_parses_to(
            "ForeverTree within 30 m",
            Expr::Query {
                target: String::from("ForeverTree"),
                distance: Node::new(scalar(30, "m")),
            },
        );
        assert_parses_to(
            "config foo else 5 m",
            Expr::ConfigValue {
                name: String::from("foo"),
                default: Some(Node::new(scalar(5, "m"))),
            },
        );
        assert_parses_to(
            "external[rainfall] at 2",
            Expr::ExternalData {
                name: String::from("rainfall"),
                at: Some(Node::new(int(2))),
            },
        );
        assert_parses_to(
            "mean(heights)",
            Expr::Call(String::from("mean"), vec![Node::new(id("heights"))]),
        );
    }

    #[test]
    fn test_program_stanzas() {
        let source = "\
start simulation Main
  steps.low = 0 count
  steps.high = 5 count
end simulation

start patch Default
  ForeverTree.init = create 10 count of ForeverTree
end patch

start organism ForeverTree
  age.init = 0 year
  age.step = prior.age + 1 year
end organism
";
        let program = parse_program(source).unwrap();
        assert_eq!(program.items.len(), 3);
        match &program.items[2] {
            Item::Entity(stanza) => {
                assert_eq!(stanza.kind, "organism");
                assert_eq!(stanza.name, "ForeverTree");
                assert_eq!(stanza.members.len(), 2);
            }
            other => panic!("expected entity stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_multiform_handler_and_state() {
        let source = "\
start organism Tree
  height.step
    :if (prior.age > 5 year) = prior.height + 1 m
    :elif (prior.age > 1 year) = prior.height + 2 m
    :else = 0 m
  start state \"adult\"
    fruit.step = 1 count
  end state
end organism
";
        let program = parse_program(source).unwrap();
        let stanza = match &program.items[0] {
            Item::Entity(stanza) => stanza,
            other => panic!("expected entity stanza, got {:?}", other),
        };
        match &stanza.members[0] {
            Member::Group(group) => {
                assert_eq!(group.name, "height.step");
                assert_eq!(group.branches.len(), 3);
                assert!(group.branches[0].cond.is_some());
                assert!(group.branches[2].cond.is_none());
            }
            other => panic!("expected handler group, got {:?}", other),
        }
        match &stanza.members[1] {
            Member::State(state) => {
                assert_eq!(state.name, "adult");
                assert_eq!(state.groups.len(), 1);
            }
            other => panic!("expected state stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_unit_stanza() {
        let source = "\
start unit km
  alias kilometer
  m = current * 1000
end unit
";
        let program = parse_program(source).unwrap();
        match &program.items[0] {
            Item::Unit(stanza) => {
                assert_eq!(stanza.name, "km");
                assert_eq!(stanza.decls.len(), 2);
                assert_eq!(stanza.decls[0], UnitDecl::Alias(String::from("kilometer")));
            }
            other => panic!("expected unit stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse_program("start patch Default\n  age.init 5\nend patch\n")
            .unwrap_err();
        match err {
            JoshError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_stanza_kind() {
        let err =
            parse_program("start patch Default\nend organism\n").unwrap_err();
        match err {
            JoshError::Parse { message, .. } => {
                assert!(message.contains("end organism"))
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
