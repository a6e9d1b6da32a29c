// Lowering: AST to action chains, stanzas to prototypes, unit
// stanzas to the converter.
//
// Expressions compile postfix for the stack machine, one eval_*
// method per node class. Handler names decode into (attribute,
// event); each stanza assembles into a shared Prototype whose
// derived indices the scheduler dispatches against.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{
    BinOp, EntityStanza, Expr, HandlerGroup, Item, Member, Number, Program,
    SampleExpr, UnOp, UnitDecl, UnitStanza,
};
use crate::convert::{Converter, ConverterBuilder, UnitTransform};
use crate::entity::{
    CompiledHandler, EntityKind, Event, EventHandlerGroup, EventKey, Prototype,
};
use crate::error::{EngineResult, JoshError};
use crate::machine::{
    Action, BinaryOp, ConditionalChain, Curve, Machine, SampleOp, UnaryOp,
};
use crate::parser;
use crate::scope::LocalScope;
use crate::units::Units;
use crate::value::{EngineValue, FunctionOp};

/// The compiled program: entity prototypes plus the converter, ready
/// for the scheduler to instantiate.
#[derive(Debug)]
pub struct CompiledProgram {
    pub prototypes: HashMap<String, Arc<Prototype>>,
    pub simulations: Vec<String>,
    pub converter: Arc<Converter>,
    pub imports: Vec<String>,
    pub config_defaults: HashMap<String, Arc<Vec<Action>>>,
}

pub fn compile_source(source: &str) -> EngineResult<CompiledProgram> {
    compile(&parser::parse_program(source)?)
}

pub fn compile(program: &Program) -> EngineResult<CompiledProgram> {
    let compiler = Compiler;
    let mut prototypes = HashMap::new();
    let mut simulations = Vec::new();
    let mut imports = Vec::new();
    let mut config_defaults = HashMap::new();
    let mut units = ConverterBuilder::new();

    for item in &program.items {
        match item {
            Item::Entity(stanza) => {
                let proto = compiler.compile_entity(stanza)?;
                if proto.kind == EntityKind::Simulation {
                    simulations.push(proto.name.clone());
                }
                if prototypes
                    .insert(proto.name.clone(), Arc::new(proto))
                    .is_some()
                {
                    return Err(compile_error(format!(
                        "entity '{}' is declared twice",
                        stanza.name
                    )));
                }
            }
            Item::Unit(stanza) => compiler.compile_unit(stanza, &mut units)?,
            Item::Import(path) => imports.push(path.clone()),
            Item::ConfigDefault(name, expr) => {
                let chain = compiler.compile_chain(expr)?;
                config_defaults.insert(name.clone(), Arc::new(chain));
            }
        }
    }

    Ok(CompiledProgram {
        prototypes,
        simulations,
        converter: Arc::new(units.build()),
        imports,
        config_defaults,
    })
}

fn compile_error(message: String) -> JoshError {
    JoshError::Parse {
        line: 0,
        col: 0,
        message,
    }
}

// Names the language spends on its own machinery; declaring one is
// an error rather than a shadowing surprise.
const RESERVED: &[&str] = &[
    "init", "start", "step", "end", "remove", "constant", "prior", "current",
    "here", "meta",
];

fn check_declarable(name: &str) -> EngineResult<()> {
    if RESERVED.contains(&name) {
        return Err(JoshError::ReservedWord(name.to_string()));
    }
    Ok(())
}

struct Compiler;

impl Compiler {
    fn compile_entity(&self, stanza: &EntityStanza) -> EngineResult<Prototype> {
        let kind = EntityKind::from_word(&stanza.kind).ok_or_else(|| {
            compile_error(format!("unknown entity kind '{}'", stanza.kind))
        })?;
        check_declarable(&stanza.name)?;

        let mut groups = Vec::new();
        for member in &stanza.members {
            match member {
                Member::Group(group) => {
                    groups.push(self.compile_group(None, group)?);
                }
                Member::State(state) => {
                    for group in &state.groups {
                        groups.push(
                            self.compile_group(Some(state.name.clone()), group)?,
                        );
                    }
                }
            }
        }
        Ok(Prototype::assemble(stanza.name.clone(), kind, groups))
    }

    fn compile_group(
        &self,
        state: Option<String>,
        group: &HandlerGroup,
    ) -> EngineResult<EventHandlerGroup> {
        let (attribute, event) = EventKey::decode(&group.name);
        let leading = attribute.split('.').next().unwrap_or(&attribute);
        check_declarable(leading)?;

        let mut handlers = Vec::new();
        for branch in &group.branches {
            let selector = match &branch.cond {
                Some(cond) => Some(Arc::new(self.compile_chain(cond)?)),
                None => None,
            };
            let mut body = self.compile_chain(&branch.body)?;
            body.push(Action::End);
            handlers.push(CompiledHandler {
                selector,
                body: Arc::new(body),
            });
        }
        Ok(EventHandlerGroup {
            key: EventKey {
                state,
                attribute,
                event,
            },
            handlers,
        })
    }

    fn compile_unit(
        &self,
        stanza: &UnitStanza,
        builder: &mut ConverterBuilder,
    ) -> EngineResult<()> {
        check_declarable(&stanza.name)?;
        let src = Units::parse(&stanza.name)?;
        for decl in &stanza.decls {
            match decl {
                UnitDecl::Alias(alias) => {
                    check_declarable(alias)?;
                    builder.add_alias(src.clone(), Units::parse(alias)?);
                }
                UnitDecl::Conversion(dst, body) => {
                    let chain = self.compile_chain(body)?;
                    builder.add_conversion(
                        src.clone(),
                        Units::parse(dst)?,
                        Arc::new(CompiledCallable { chain }),
                    );
                }
            }
        }
        Ok(())
    }

    /// Compile an expression to a bare chain (no trailing End).
    fn compile_chain(&self, expr: &Expr) -> EngineResult<Vec<Action>> {
        let mut out = Vec::new();
        self.eval_expr(expr, &mut out)?;
        Ok(out)
    }

    fn eval_expr(&self, expr: &Expr, out: &mut Vec<Action>) -> EngineResult<()> {
        match expr {
            Expr::Scalar(number, unit) => self.eval_scalar(number, unit.as_deref(), out),
            Expr::Bool(v) => {
                out.push(Action::Push(EngineValue::Bool(*v)));
                Ok(())
            }
            Expr::Str(v) => {
                out.push(Action::Push(EngineValue::Str(v.clone())));
                Ok(())
            }
            Expr::Ident(name) => {
                out.push(Action::Resolve(name.clone()));
                Ok(())
            }
            Expr::Binary(op, l, r) => self.eval_binop(*op, l, r, out),
            Expr::Unary(op, operand) => {
                self.eval_expr(operand, out)?;
                out.push(Action::Unary(match op {
                    UnOp::Neg => UnaryOp::Neg,
                    UnOp::Not => UnaryOp::Not,
                }));
                Ok(())
            }
            Expr::Cond(arms, otherwise) => self.eval_cond(arms, otherwise, out),
            Expr::Call(name, args) => self.eval_call(name, args, out),
            Expr::Cast { value, unit, force } => {
                self.eval_expr(value, out)?;
                out.push(Action::Cast {
                    to: Units::parse(unit)?,
                    force: *force,
                });
                Ok(())
            }
            Expr::Limit { value, low, high } => {
                self.eval_expr(value, out)?;
                self.eval_expr(low, out)?;
                self.eval_expr(high, out)?;
                out.push(Action::Limit);
                Ok(())
            }
            Expr::MapRange {
                value,
                from,
                to,
                curve,
            } => {
                self.eval_expr(value, out)?;
                self.eval_expr(&from.0, out)?;
                self.eval_expr(&from.1, out)?;
                self.eval_expr(&to.0, out)?;
                self.eval_expr(&to.1, out)?;
                let curve = match curve {
                    None => Curve::Linear,
                    Some(name) => Curve::from_name(name).ok_or_else(|| {
                        compile_error(format!("unknown map curve '{}'", name))
                    })?,
                };
                out.push(Action::MapRange { curve });
                Ok(())
            }
            Expr::Sample(sample) => self.eval_sample(sample, out),
            Expr::Create { count, entity } => {
                if let Some(count) = count {
                    self.eval_expr(count, out)?;
                }
                out.push(Action::Create {
                    prototype: entity.clone(),
                    counted: count.is_some(),
                });
                Ok(())
            }
            Expr::Query { target, distance } => {
                self.eval_expr(distance, out)?;
                out.push(Action::Query {
                    target: target.clone(),
                });
                Ok(())
            }
            Expr::ExternalData { name, at } => {
                if let Some(at) = at {
                    self.eval_expr(at, out)?;
                }
                out.push(Action::External {
                    name: name.clone(),
                    timed: at.is_some(),
                });
                Ok(())
            }
            Expr::ConfigValue { name, default } => {
                let default = match default {
                    Some(expr) => Some(Arc::new(self.compile_chain(expr)?)),
                    None => None,
                };
                out.push(Action::Config {
                    name: name.clone(),
                    default,
                });
                Ok(())
            }
            Expr::Position(a, b) => {
                // A position is a two-element distribution; the grid
                // layer interprets it.
                self.eval_expr(a, out)?;
                self.eval_expr(b, out)?;
                out.push(Action::Concat);
                Ok(())
            }
        }
    }

    fn eval_scalar(
        &self,
        number: &Number,
        unit: Option<&str>,
        out: &mut Vec<Action>,
    ) -> EngineResult<()> {
        let units = match unit {
            Some(text) => Units::parse(text)?,
            None => Units::empty(),
        };
        let value = match number {
            Number::Int(v) => EngineValue::Int(*v, units),
            Number::Decimal(v) => EngineValue::Decimal(v.clone(), units),
        };
        out.push(Action::Push(value));
        Ok(())
    }

    fn eval_binop(
        &self,
        op: BinOp,
        l: &Expr,
        r: &Expr,
        out: &mut Vec<Action>,
    ) -> EngineResult<()> {
        self.eval_expr(l, out)?;
        self.eval_expr(r, out)?;
        out.push(Action::Binary(match op {
            BinOp::Add => BinaryOp::Add,
            BinOp::Sub => BinaryOp::Sub,
            BinOp::Mul => BinaryOp::Mul,
            BinOp::Div => BinaryOp::Div,
            BinOp::Pow => BinaryOp::Pow,
            BinOp::And => BinaryOp::And,
            BinOp::Or => BinaryOp::Or,
            BinOp::Xor => BinaryOp::Xor,
            BinOp::Lt => BinaryOp::Lt,
            BinOp::Gt => BinaryOp::Gt,
            BinOp::Lte => BinaryOp::Lte,
            BinOp::Gte => BinaryOp::Gte,
            BinOp::Eq => BinaryOp::Eq,
            BinOp::Neq => BinaryOp::Neq,
        }));
        Ok(())
    }

    fn eval_cond(
        &self,
        arms: &[(crate::ast::Node<Expr>, crate::ast::Node<Expr>)],
        otherwise: &Expr,
        out: &mut Vec<Action>,
    ) -> EngineResult<()> {
        let mut compiled = Vec::new();
        for (cond, body) in arms {
            compiled.push((self.compile_chain(cond)?, self.compile_chain(body)?));
        }
        out.push(Action::Branch(Arc::new(ConditionalChain {
            arms: compiled,
            otherwise: Some(self.compile_chain(otherwise)?),
        })));
        Ok(())
    }

    fn eval_call(
        &self,
        name: &str,
        args: &[crate::ast::Node<Expr>],
        out: &mut Vec<Action>,
    ) -> EngineResult<()> {
        let arity = |n: usize| -> EngineResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(compile_error(format!(
                    "{} takes {} argument{}, got {}",
                    name,
                    n,
                    if n == 1 { "" } else { "s" },
                    args.len()
                )))
            }
        };
        if let Some(op) = FunctionOp::from_name(name) {
            arity(1)?;
            self.eval_expr(&args[0], out)?;
            out.push(Action::Function(op));
            return Ok(());
        }
        match name {
            "concat" => {
                arity(2)?;
                self.eval_expr(&args[0], out)?;
                self.eval_expr(&args[1], out)?;
                out.push(Action::Concat);
                Ok(())
            }
            "slice" => {
                arity(3)?;
                self.eval_expr(&args[0], out)?;
                self.eval_expr(&args[1], out)?;
                self.eval_expr(&args[2], out)?;
                out.push(Action::Slice);
                Ok(())
            }
            _ => Err(compile_error(format!("unknown function '{}'", name))),
        }
    }

    fn eval_sample(&self, sample: &SampleExpr, out: &mut Vec<Action>) -> EngineResult<()> {
        match sample {
            SampleExpr::Draw(e) => {
                self.eval_expr(e, out)?;
                out.push(Action::Sample(SampleOp::Draw));
            }
            SampleExpr::Take {
                count,
                source,
                with_replacement,
            } => {
                self.eval_expr(count, out)?;
                self.eval_expr(source, out)?;
                out.push(Action::Sample(SampleOp::Take {
                    with_replacement: *with_replacement,
                }));
            }
            SampleExpr::Uniform(a, b) => {
                self.eval_expr(a, out)?;
                self.eval_expr(b, out)?;
                out.push(Action::Sample(SampleOp::Uniform));
            }
            SampleExpr::Normal(mean, std) => {
                self.eval_expr(mean, out)?;
                self.eval_expr(std, out)?;
                out.push(Action::Sample(SampleOp::Normal));
            }
        }
        Ok(())
    }
}

/// A conversion body compiled from a unit stanza: consumes a scope
/// holding `current` and produces the destination-units value.
#[derive(Debug)]
struct CompiledCallable {
    chain: Vec<Action>,
}

impl UnitTransform for CompiledCallable {
    fn apply(&self, value: EngineValue) -> EngineResult<EngineValue> {
        // Conversion bodies do not depend on other conversions; they
        // run against the identity converter.
        let mut scope = LocalScope::new(Arc::new(Converter::identity()));
        let mut locals = HashMap::new();
        locals.insert("current".to_string(), value);
        Machine::with_locals(&mut scope, locals).evaluate(&self.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;

    fn eval(source: &str) -> EngineResult<EngineValue> {
        let chain = Compiler.compile_chain(&parse_expression(source).unwrap())?;
        let mut scope = LocalScope::new(Arc::new(Converter::identity()));
        Machine::new(&mut scope).evaluate(&chain)
    }

    fn eval_ok(source: &str) -> EngineValue {
        eval(source).unwrap()
    }

    #[test]
    fn test_arithmetic_pipeline() {
        assert_eq!(eval_ok("1 + 2 * 3"), EngineValue::dimensionless(7));
        assert_eq!(
            eval_ok("2 ^ 3").to_decimal().unwrap(),
            bigdecimal::BigDecimal::from(8)
        );
        assert_eq!(
            eval_ok("10 m / 2 s"),
            EngineValue::Int(5, Units::parse("m / s").unwrap())
        );
    }

    #[test]
    fn test_conditionals() {
        assert_eq!(eval_ok("1 > 2 ? 10 : 20"), EngineValue::dimensionless(20));
        assert_eq!(
            eval_ok("if 1 > 2 { 1 } elif 2 > 1 { 2 } else { 3 }"),
            EngineValue::dimensionless(2)
        );
    }

    #[test]
    fn test_limit_and_functions() {
        assert_eq!(
            eval_ok("limit 15 m to [0 m, 10 m]"),
            EngineValue::Int(10, Units::atom("m"))
        );
        assert_eq!(eval_ok("abs(0 - 4)"), EngineValue::dimensionless(4));
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        assert!(matches!(eval("frobnicate(1)"), Err(JoshError::Parse { .. })));
        assert!(matches!(eval("mean(1, 2)"), Err(JoshError::Parse { .. })));
    }

    #[test]
    fn test_config_default() {
        assert_eq!(
            eval_ok("config foo else 5 m"),
            EngineValue::Int(5, Units::atom("m"))
        );
    }

    #[test]
    fn test_position_is_a_pair() {
        let value = eval_ok("(2.5, 3.5)");
        match value {
            EngineValue::Distribution(d) => {
                assert_eq!(d.realize().unwrap().len(), 2);
            }
            other => panic!("expected distribution, got {:?}", other),
        }
    }

    fn counter_program() -> CompiledProgram {
        compile_source(
            "\
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
",
        )
        .unwrap()
    }

    #[test]
    fn test_program_assembly() {
        let program = counter_program();
        assert_eq!(program.simulations, vec!["Main"]);
        let tree = &program.prototypes["ForeverTree"];
        assert_eq!(tree.kind, EntityKind::Agent);
        let age = tree.slot("age").unwrap();
        assert!(tree.has_event(age, Event::Init));
        assert!(tree.has_event(age, Event::Step));
        let sim = &program.prototypes["Main"];
        let steps = sim.slot("steps.high").unwrap();
        assert!(sim.has_event(steps, Event::Constant));
    }

    #[test]
    fn test_handler_bodies_end() {
        let program = counter_program();
        let tree = &program.prototypes["ForeverTree"];
        let slot = tree.slot("age").unwrap();
        let handlers = tree.handlers(slot, Event::Step, None).unwrap();
        assert_eq!(handlers.len(), 1);
        assert!(matches!(
            handlers[0].body.last(),
            Some(Action::End)
        ));
    }

    #[test]
    fn test_reserved_words_rejected() {
        let err = compile_source("start patch step\nend patch\n").unwrap_err();
        assert_eq!(err, JoshError::ReservedWord("step".to_string()));
        let err =
            compile_source("start patch P\n  prior.x.init = 1\nend patch\n")
                .unwrap_err();
        assert_eq!(err, JoshError::ReservedWord("prior".to_string()));
    }

    #[test]
    fn test_unit_stanza_builds_converter() {
        let program = compile_source(
            "\
start unit km
  alias kilometers
  m = current * 1000
end unit
",
        )
        .unwrap();
        let km = Units::atom("km");
        let m = Units::atom("m");
        let out = program
            .converter
            .convert(EngineValue::Int(2, km.clone()), &m)
            .unwrap();
        assert_eq!(out.to_decimal().unwrap(), bigdecimal::BigDecimal::from(2000));
        assert_eq!(out.units(), m);
        let alias = program
            .converter
            .convert(EngineValue::Int(7, km), &Units::atom("kilometers"))
            .unwrap();
        assert_eq!(alias.to_decimal().unwrap(), bigdecimal::BigDecimal::from(7));
    }

    #[test]
    fn test_imports_are_recorded() {
        let program = compile_source(
            "import \"lib/units.josh\"\nimport \"lib/trees.josh\"\n",
        )
        .unwrap();
        assert_eq!(
            program.imports,
            vec!["lib/units.josh", "lib/trees.josh"]
        );
    }

    #[test]
    fn test_state_groups_are_keyed() {
        let program = compile_source(
            "\
start organism Tree
  state.init = \"young\"
  fruit.step = 0 count
  start state \"adult\"
    fruit.step = 1 count
  end state
end organism
",
        )
        .unwrap();
        let tree = &program.prototypes["Tree"];
        let fruit = tree.slot("fruit").unwrap();
        assert!(tree.handlers(fruit, Event::Step, Some("adult")).is_some());
        let adult = tree.handlers(fruit, Event::Step, Some("adult")).unwrap();
        let young = tree.handlers(fruit, Event::Step, Some("young")).unwrap();
        // The adult state sees its own handler, everyone else the
        // stateless one.
        assert!(!Arc::ptr_eq(&adult, &young));
    }
}
