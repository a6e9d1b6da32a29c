use std::rc::Rc;

use bigdecimal::BigDecimal;

// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<Node<T>>;

// Arithmetic, logic, and relational operations.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    And,
    Or,
    Xor,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnOp {
    Not,
    Neg,
}

// Numeric literals keep the lexer's distinction so the engine can
// stay in integer arithmetic until a decimal forces widening.
#[derive(Clone, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Decimal(BigDecimal),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SampleExpr {
    /// `sample d` — one draw from a distribution.
    Draw(Node<Expr>),
    /// `sample n from d [with replacement]`.
    Take {
        count: Node<Expr>,
        source: Node<Expr>,
        with_replacement: bool,
    },
    /// `sample uniform from a to b`.
    Uniform(Node<Expr>, Node<Expr>),
    /// `sample normal with mean of m std of s`.
    Normal(Node<Expr>, Node<Expr>),
}

// ADT for expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Scalar(Number, Option<String>),
    Bool(bool),
    Str(String),
    /// Identifier, possibly dotted (`prior.age`, `here.Tree.height`).
    /// Namespaces are resolved at runtime by the scope chain.
    Ident(String),
    Binary(BinOp, Node<Expr>, Node<Expr>),
    Unary(UnOp, Node<Expr>),
    /// if/elif arms plus a mandatory else; the ternary operator
    /// lowers to a single arm.
    Cond(Vec<(Node<Expr>, Node<Expr>)>, Node<Expr>),
    /// Builtin call: abs, ceil, floor, round, log10, ln, count, max,
    /// min, mean, std, sum, concat, slice. Validated by the compiler.
    Call(String, Seq<Expr>),
    Cast {
        value: Node<Expr>,
        unit: String,
        force: bool,
    },
    Limit {
        value: Node<Expr>,
        low: Node<Expr>,
        high: Node<Expr>,
    },
    MapRange {
        value: Node<Expr>,
        from: (Node<Expr>, Node<Expr>),
        to: (Node<Expr>, Node<Expr>),
        curve: Option<String>,
    },
    Sample(SampleExpr),
    /// `create <count> of Name` or `create Name`.
    Create {
        count: Option<Node<Expr>>,
        entity: String,
    },
    /// `here within d` or `Name within d`.
    Query {
        target: String,
        distance: Node<Expr>,
    },
    ExternalData {
        name: String,
        at: Option<Node<Expr>>,
    },
    ConfigValue {
        name: String,
        default: Option<Node<Expr>>,
    },
    Position(Node<Expr>, Node<Expr>),
}

// A single handler: optional selector plus a body expression. The
// single form `attr.event = expr` is one unconditional branch.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerBranch {
    pub cond: Option<Node<Expr>>,
    pub body: Node<Expr>,
}

/// One `attr.event` group. The name still carries the trailing event
/// token; the compiler decodes it.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerGroup {
    pub name: String,
    pub branches: Vec<HandlerBranch>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateStanza {
    pub name: String,
    pub groups: Vec<HandlerGroup>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Member {
    Group(HandlerGroup),
    State(StateStanza),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityStanza {
    /// The kind word as written (`organism` and `management` both
    /// compile to agents).
    pub kind: String,
    pub name: String,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UnitDecl {
    Alias(String),
    /// `<dst> = <expr over current>`.
    Conversion(String, Node<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitStanza {
    pub name: String,
    pub decls: Vec<UnitDecl>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Entity(EntityStanza),
    Unit(UnitStanza),
    Import(String),
    ConfigDefault(String, Node<Expr>),
}

// ADT for programs.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
}

pub fn bin(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary(op, Node::new(left), Node::new(right))
}
