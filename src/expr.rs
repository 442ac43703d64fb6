//! Expression terms for counts, lengths, conditions, virtual and implicit fields.
//!
//! Evaluation works over a [`Scope`]: the codec's stack of frames (parameters, implicit
//! values and already decoded fields). Names are looked up innermost frame first; dotted
//! paths (`header.length`) navigate nested records.

use crate::error::CodecError;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;

/// Constant in a schema: const/reserved values, case tuples, fill values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Literal::UInt(x) => Some(*x),
            Literal::Int(x) if *x >= 0 => Some(*x as u64),
            Literal::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::UInt(x) => Some(*x as f64),
            Literal::Int(x) => Some(*x as f64),
            Literal::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub(crate) fn as_i128(&self) -> Option<i128> {
        match self {
            Literal::UInt(x) => Some(*x as i128),
            Literal::Int(x) => Some(*x as i128),
            Literal::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::UInt(x) => Value::UInt(*x),
            Literal::Int(x) if *x >= 0 => Value::UInt(*x as u64),
            Literal::Int(x) => Value::Int(*x),
            Literal::Float(x) => Value::Float(*x),
            Literal::Str(s) => Value::String(s.clone()),
        }
    }

    /// Same constant regardless of numeric representation.
    pub fn same_as(&self, other: &Literal) -> bool {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::UInt(x) => write!(f, "{:#x}", x),
            Literal::Int(x) => write!(f, "{}", x),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for Literal {
    fn from(x: u64) -> Self {
        Literal::UInt(x)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Element count of a list, byte array or string.
    Count,
    /// Integer division rounding up: `CEIL_DIV(a, b)`.
    CeilDiv,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Dotted path, one segment per element.
    Var(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

impl Expr {
    /// `Expr::var("header.length")`.
    pub fn var(path: &str) -> Expr {
        Expr::Var(path.split('.').map(str::to_string).collect())
    }

    pub fn uint(x: u64) -> Expr {
        Expr::Literal(Literal::UInt(x))
    }

    pub fn int(x: i64) -> Expr {
        Expr::Literal(Literal::Int(x))
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Literal(Literal::Bool(b))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn not(inner: Expr) -> Expr {
        Expr::Unary(UnaryOp::Not, Box::new(inner))
    }

    pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    /// `COUNT(path)`.
    pub fn count(path: &str) -> Expr {
        Expr::Call(Builtin::Count, vec![Expr::var(path)])
    }

    pub fn equals(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, self, rhs)
    }

    pub fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }

    pub fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }

    pub fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }

    /// Root names referenced by this expression.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'e>(&'e self, out: &mut Vec<&'e str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(path) => {
                if let Some(root) = path.first() {
                    out.push(root);
                }
            }
            Expr::Unary(_, e) => e.collect_variables(out),
            Expr::Binary(_, a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Expr::Ternary(c, a, b) => {
                c.collect_variables(out);
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_variables(out)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(l) => write!(f, "{}", l),
            Expr::Var(path) => write!(f, "{}", path.join(".")),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "!{}", e),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{}", e),
            Expr::Binary(op, a, b) => write!(f, "({} {} {})", a, op.symbol(), b),
            Expr::Ternary(c, a, b) => write!(f, "({} ? {} : {})", c, a, b),
            Expr::Call(b, args) => {
                let name = match b {
                    Builtin::Count => "COUNT",
                    Builtin::CeilDiv => "CEIL_DIV",
                };
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
        }
    }
}

/// Name lookup for expression evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for IndexMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Resolve a dotted path: the first segment through the scope, the rest through records.
pub fn lookup_path<'s>(scope: &'s dyn Scope, path: &[String]) -> Option<&'s Value> {
    let (root, rest) = path.split_first()?;
    let mut current = scope.lookup(root)?;
    for segment in rest {
        current = current.as_record()?.get(segment)?;
    }
    Some(current)
}

pub fn eval(expr: &Expr, scope: &dyn Scope) -> Result<Value, CodecError> {
    match expr {
        Expr::Literal(l) => Ok(l.to_value()),
        Expr::Var(path) => lookup_path(scope, path)
            .cloned()
            .ok_or_else(|| CodecError::Expression(format!("unknown name {}", path.join(".")))),
        Expr::Unary(UnaryOp::Not, e) => Ok(Value::Bool(!truthy(&eval(e, scope)?)?)),
        Expr::Unary(UnaryOp::Neg, e) => match eval(e, scope)? {
            Value::Float(x) => Ok(Value::Float(-x)),
            v => int_value(-integer(&v)?),
        },
        Expr::Binary(BinaryOp::And, a, b) => {
            Ok(Value::Bool(truthy(&eval(a, scope)?)? && truthy(&eval(b, scope)?)?))
        }
        Expr::Binary(BinaryOp::Or, a, b) => {
            Ok(Value::Bool(truthy(&eval(a, scope)?)? || truthy(&eval(b, scope)?)?))
        }
        Expr::Binary(op, a, b) => binary(*op, &eval(a, scope)?, &eval(b, scope)?),
        Expr::Ternary(c, a, b) => {
            if truthy(&eval(c, scope)?)? {
                eval(a, scope)
            } else {
                eval(b, scope)
            }
        }
        Expr::Call(Builtin::Count, args) => {
            let [arg] = args.as_slice() else {
                return Err(CodecError::Expression("COUNT takes one argument".to_string()));
            };
            let v = eval(arg, scope)?;
            v.len()
                .map(|n| Value::UInt(n as u64))
                .ok_or_else(|| CodecError::Expression(format!("COUNT of a {}", v.kind())))
        }
        Expr::Call(Builtin::CeilDiv, args) => {
            let [a, b] = args.as_slice() else {
                return Err(CodecError::Expression("CEIL_DIV takes two arguments".to_string()));
            };
            let a = integer(&eval(a, scope)?)?;
            let b = integer(&eval(b, scope)?)?;
            if b == 0 {
                return Err(CodecError::Expression("division by zero".to_string()));
            }
            int_value((a + b - 1).div_euclid(b))
        }
    }
}

/// Evaluates to an unsigned count or length.
pub fn eval_u64(expr: &Expr, scope: &dyn Scope) -> Result<u64, CodecError> {
    let v = eval(expr, scope)?;
    v.as_u64()
        .ok_or_else(|| CodecError::Expression(format!("{} is not a non-negative integer ({})", expr, v)))
}

pub fn eval_bool(expr: &Expr, scope: &dyn Scope) -> Result<bool, CodecError> {
    truthy(&eval(expr, scope)?)
}

fn truthy(v: &Value) -> Result<bool, CodecError> {
    v.as_bool()
        .ok_or_else(|| CodecError::Expression(format!("{} is not a boolean", v.kind())))
}

fn integer(v: &Value) -> Result<i128, CodecError> {
    v.as_i128()
        .ok_or_else(|| CodecError::Expression(format!("{} is not an integer", v.kind())))
}

fn int_value(x: i128) -> Result<Value, CodecError> {
    if let Ok(u) = u64::try_from(x) {
        Ok(Value::UInt(u))
    } else if let Ok(i) = i64::try_from(x) {
        Ok(Value::Int(i))
    } else {
        Err(CodecError::Expression(format!("{} overflows 64 bits", x)))
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, CodecError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(a.loosely_equals(b))),
        BinaryOp::Ne => return Ok(Value::Bool(!a.loosely_equals(b))),
        _ => {}
    }
    if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
        let (x, y) = match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(CodecError::Expression(format!("{} {} {}", a.kind(), op.symbol(), b.kind()))),
        };
        return Ok(match op {
            BinaryOp::Add => Value::Float(x + y),
            BinaryOp::Sub => Value::Float(x - y),
            BinaryOp::Mul => Value::Float(x * y),
            BinaryOp::Div => Value::Float(x / y),
            BinaryOp::Lt => Value::Bool(x < y),
            BinaryOp::Le => Value::Bool(x <= y),
            BinaryOp::Gt => Value::Bool(x > y),
            BinaryOp::Ge => Value::Bool(x >= y),
            _ => return Err(CodecError::Expression(format!("{} on floats", op.symbol()))),
        });
    }
    let x = integer(a)?;
    let y = integer(b)?;
    let checked = |r: Option<i128>| r.ok_or_else(|| CodecError::Expression(format!("{} {} {}", x, op.symbol(), y)));
    match op {
        BinaryOp::Add => int_value(checked(x.checked_add(y))?),
        BinaryOp::Sub => int_value(checked(x.checked_sub(y))?),
        BinaryOp::Mul => int_value(checked(x.checked_mul(y))?),
        BinaryOp::Div => int_value(checked(x.checked_div(y))?),
        BinaryOp::Mod => int_value(checked(x.checked_rem(y))?),
        BinaryOp::BitAnd => int_value(x & y),
        BinaryOp::BitOr => int_value(x | y),
        BinaryOp::Shl => int_value(checked(u32::try_from(y).ok().and_then(|s| x.checked_shl(s)))?),
        BinaryOp::Shr => int_value(checked(u32::try_from(y).ok().and_then(|s| x.checked_shr(s)))?),
        BinaryOp::Lt => Ok(Value::Bool(x < y)),
        BinaryOp::Le => Ok(Value::Bool(x <= y)),
        BinaryOp::Gt => Ok(Value::Bool(x > y)),
        BinaryOp::Ge => Ok(Value::Bool(x >= y)),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => {
            Err(CodecError::Expression(format!("unexpected operator {}", op.symbol())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    fn scope() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("len".to_string(), Value::UInt(7));
        m.insert("flag".to_string(), Value::Bool(true));
        m.insert("items".to_string(), Value::List(vec![Value::UInt(1), Value::UInt(2)]));
        m.insert(
            "header".to_string(),
            Value::Record(Record::new("Header").with("length", 12u8)),
        );
        m
    }

    #[test]
    fn arithmetic_and_paths() {
        let s = scope();
        assert_eq!(eval(&Expr::var("len").sub(Expr::uint(3)), &s).unwrap(), Value::UInt(4));
        assert_eq!(eval(&Expr::var("len").sub(Expr::uint(9)), &s).unwrap(), Value::Int(-2));
        assert_eq!(eval_u64(&Expr::var("header.length").mul(Expr::uint(8)), &s).unwrap(), 96);
        assert_eq!(eval_u64(&Expr::count("items"), &s).unwrap(), 2);
        let ceil = Expr::Call(Builtin::CeilDiv, vec![Expr::var("len"), Expr::uint(2)]);
        assert_eq!(eval_u64(&ceil, &s).unwrap(), 4);
    }

    #[test]
    fn conditions() {
        let s = scope();
        assert!(eval_bool(&Expr::var("flag"), &s).unwrap());
        assert!(!eval_bool(&Expr::not(Expr::var("flag")), &s).unwrap());
        assert!(eval_bool(&Expr::var("len").equals(Expr::uint(7)), &s).unwrap());
        let pick = Expr::ternary(Expr::var("flag"), Expr::uint(1), Expr::uint(2));
        assert_eq!(eval_u64(&pick, &s).unwrap(), 1);
    }

    #[test]
    fn errors_are_reported() {
        let s = scope();
        assert!(matches!(eval(&Expr::var("missing"), &s), Err(CodecError::Expression(_))));
        let div = Expr::binary(BinaryOp::Div, Expr::var("len"), Expr::uint(0));
        assert!(eval(&div, &s).is_err());
        assert!(eval_u64(&Expr::int(-1), &s).is_err());
    }

    #[test]
    fn display_and_variables() {
        let e = Expr::var("a.b").add(Expr::count("items"));
        assert_eq!(e.to_string(), "(a.b + COUNT(items))");
        assert_eq!(e.variables(), vec!["a", "items"]);
    }
}
