//! In-memory evaluation of query expressions rooted at an object.
//!
//! Paths start at the root object; a leading segment that is not a member
//! of its class names the root itself. Comparisons follow SQL's
//! three-valued logic with `Null` as unknown.

use std::cmp::Ordering;

use sqlobject_core::{Error, Result, Value};
use sqlobject_query::{BinaryOp, ContainsTarget, Expr, Path, UnaryOp};

use crate::Transaction;
use crate::object::ObjectId;

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        other => other.as_bool(),
    }
}

fn logical(value: Option<bool>) -> Value {
    value.map_or(Value::Null, Value::Bool)
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if left == right {
        return Some(Ordering::Equal);
    }
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if !matches!(left, Value::Bool(_)) && !matches!(right, Value::Bool(_)) {
            let value = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if b == 0 => return Ok(Value::Null),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Mod if b == 0 => return Ok(Value::Null),
                BinaryOp::Mod => a.checked_rem(b),
                _ => None,
            };
            return value
                .map(Value::BigInt)
                .ok_or_else(|| Error::Custom(format!("integer overflow in {a} {op:?} {b}")));
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(Error::Type(sqlobject_core::TypeError {
            expected: "numeric operands",
            actual: format!("{} {:?} {}", left.type_name(), op, right.type_name()),
            field: None,
        }));
    };
    Ok(match op {
        BinaryOp::Add => Value::Double(a + b),
        BinaryOp::Sub => Value::Double(a - b),
        BinaryOp::Mul => Value::Double(a * b),
        BinaryOp::Div if b == 0.0 => Value::Null,
        BinaryOp::Div => Value::Double(a / b),
        BinaryOp::Mod if b == 0.0 => Value::Null,
        BinaryOp::Mod => Value::Double(a % b),
        _ => Value::Null,
    })
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(s) | Value::Decimal(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL `LIKE` with `%` and `_` wildcards.
fn like(input: &str, pattern: &str) -> bool {
    let input: Vec<char> = input.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut i, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == input[i]) {
            i += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, i));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            i = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

impl Transaction {
    /// Evaluate `expr` against the object `id`.
    ///
    /// Parameters are read from `params` by position. Sub-queries are not
    /// evaluated in memory.
    pub fn evaluate(&mut self, id: ObjectId, expr: &Expr, params: &[Value]) -> Result<Value> {
        match expr {
            Expr::Path(path) => self.path_value(id, path),
            Expr::Literal { value, declared } => match declared {
                Some(ty) => ty.coerce(value.clone()),
                None => Ok(value.clone()),
            },
            Expr::Parameter { index, declared } => {
                let value = params.get(*index).cloned().ok_or_else(|| {
                    Error::Custom(format!(
                        "expression expects parameter {index} but {} were supplied",
                        params.len()
                    ))
                })?;
                match declared {
                    Some(ty) => ty.coerce(value),
                    None => Ok(value),
                }
            }
            Expr::Binary { left, op, right } => self.binary(id, left, *op, right, params),
            Expr::Unary { op, expr } => {
                let value = self.evaluate(id, expr, params)?;
                match op {
                    UnaryOp::Not => Ok(logical(truth(&value).map(|b| !b))),
                    UnaryOp::Neg => match value {
                        Value::Null => Ok(Value::Null),
                        Value::Double(v) => Ok(Value::Double(-v)),
                        other => arithmetic(BinaryOp::Sub, &Value::BigInt(0), &other),
                    },
                }
            }
            Expr::IsNull { expr, negated } => {
                let value = self.evaluate(id, expr, params)?;
                Ok(Value::Bool(value.is_null() != *negated))
            }
            Expr::In { expr, list, negated } => {
                let value = self.evaluate(id, expr, params)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let mut unknown = false;
                for item in list {
                    let candidate = self.evaluate(id, item, params)?;
                    if candidate.is_null() {
                        unknown = true;
                    } else if compare(&value, &candidate) == Some(Ordering::Equal) {
                        return Ok(Value::Bool(!negated));
                    }
                }
                Ok(if unknown { Value::Null } else { Value::Bool(*negated) })
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = self.evaluate(id, expr, params)?;
                let pattern = self.evaluate(id, pattern, params)?;
                if value.is_null() || pattern.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Bool(like(&text(&value), &text(&pattern)) != *negated))
            }
            Expr::Count(path) => {
                let Some(members) = self.collection_at(id, path)? else {
                    return Ok(Value::Null);
                };
                Ok(Value::BigInt(i64::try_from(members.len()).unwrap_or(i64::MAX)))
            }
            Expr::Contains { collection, target } => {
                let ContainsTarget::Value(member) = target else {
                    return Err(Error::unsupported(
                        "in-memory sub-query",
                        "Contains over a sub-query cannot be evaluated in memory",
                    ));
                };
                let wanted = self.evaluate(id, member, params)?;
                let Some(members) = self.collection_at(id, collection)? else {
                    return Ok(Value::Null);
                };
                if wanted.is_null() {
                    return Ok(Value::Null);
                }
                for m in members {
                    let key = self.key_of(m)?;
                    let scalar = key.as_ref().and_then(|k| k.as_scalar());
                    if scalar.and_then(|k| compare(k, &wanted)) == Some(Ordering::Equal) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::ClassOf(path) => {
                let segments = self.segments_after_root(id, path)?;
                match self.object_at(id, &segments)? {
                    Some(target) => Ok(Value::Text(self.class_of(target)?)),
                    None => Ok(Value::Null),
                }
            }
            Expr::Function { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(id, arg, params)?);
                }
                function(name, &values)
            }
            Expr::InQuery { .. } | Expr::Exists(_) | Expr::Subquery(_) => Err(Error::unsupported(
                "in-memory sub-query",
                "sub-queries cannot be evaluated in memory",
            )),
            Expr::Star => Err(Error::unsupported(
                "in-memory star",
                "'*' is only meaningful inside an aggregate",
            )),
        }
    }

    fn binary(
        &mut self,
        id: ObjectId,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        params: &[Value],
    ) -> Result<Value> {
        let l = self.evaluate(id, left, params)?;
        match op {
            BinaryOp::And if truth(&l) == Some(false) => return Ok(Value::Bool(false)),
            BinaryOp::Or if truth(&l) == Some(true) => return Ok(Value::Bool(true)),
            _ => {}
        }
        let r = self.evaluate(id, right, params)?;
        match op {
            BinaryOp::And => Ok(match (truth(&l), truth(&r)) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }),
            BinaryOp::Or => Ok(match (truth(&l), truth(&r)) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }),
            _ if l.is_null() || r.is_null() => Ok(Value::Null),
            BinaryOp::Eq => Ok(logical(compare(&l, &r).map(Ordering::is_eq))),
            BinaryOp::Ne => Ok(logical(compare(&l, &r).map(Ordering::is_ne))),
            BinaryOp::Lt => Ok(logical(compare(&l, &r).map(Ordering::is_lt))),
            BinaryOp::Le => Ok(logical(compare(&l, &r).map(Ordering::is_le))),
            BinaryOp::Gt => Ok(logical(compare(&l, &r).map(Ordering::is_gt))),
            BinaryOp::Ge => Ok(logical(compare(&l, &r).map(Ordering::is_ge))),
            BinaryOp::Concat => Ok(Value::Text(text(&l) + &text(&r))),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                arithmetic(op, &l, &r)
            }
        }
    }

    /// Path segments with the leading root alias dropped.
    fn segments_after_root(&mut self, id: ObjectId, path: &Path) -> Result<Vec<String>> {
        let class = self.class_of(id)?;
        let info = self.schema.class(&class)?;
        let skip = usize::from(!path.is_empty() && !info.has_member(path.first()));
        Ok(path.segments[skip..].to_vec())
    }

    /// Object reached by following every segment as a reference; `None`
    /// when a reference on the way is null.
    fn object_at(&mut self, id: ObjectId, segments: &[String]) -> Result<Option<ObjectId>> {
        let mut current = id;
        for segment in segments {
            match self.reference(current, segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn path_value(&mut self, id: ObjectId, path: &Path) -> Result<Value> {
        let segments = self.segments_after_root(id, path)?;
        let Some((last, hops)) = segments.split_last() else {
            let key = self.key_of(id)?;
            return Ok(key
                .as_ref()
                .and_then(|k| k.as_scalar())
                .cloned()
                .unwrap_or(Value::Null));
        };
        let Some(owner) = self.object_at(id, hops)? else {
            return Ok(Value::Null);
        };
        let class = self.class_of(owner)?;
        if self.schema.class(&class)?.collection(last).is_some() {
            return Err(Error::unsupported(
                "collection value",
                format!("'{path}' is a collection; use Count or Contains"),
            ));
        }
        self.value(owner, last)
    }

    fn collection_at(&mut self, id: ObjectId, path: &Path) -> Result<Option<Vec<ObjectId>>> {
        let segments = self.segments_after_root(id, path)?;
        let Some((name, hops)) = segments.split_last() else {
            return Err(Error::unresolved(path.to_string(), "collections"));
        };
        match self.object_at(id, hops)? {
            Some(owner) => Ok(Some(self.collection(owner, name)?)),
            None => Ok(None),
        }
    }
}

fn function(name: &str, args: &[Value]) -> Result<Value> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match name.to_ascii_lowercase().as_str() {
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        _ if args.first().is_some_and(Value::is_null) => Ok(Value::Null),
        "lower" => Ok(Value::Text(text(&arg(0)).to_lowercase())),
        "upper" => Ok(Value::Text(text(&arg(0)).to_uppercase())),
        "length" | "len" => Ok(Value::BigInt(
            i64::try_from(text(&arg(0)).chars().count()).unwrap_or(i64::MAX),
        )),
        "abs" => match arg(0) {
            Value::Double(v) => Ok(Value::Double(v.abs())),
            other => other
                .as_i64()
                .and_then(i64::checked_abs)
                .map(Value::BigInt)
                .ok_or_else(|| Error::Custom(format!("abs of {} is not representable", other))),
        },
        other => Err(Error::unsupported(
            "in-memory function",
            format!("function '{other}' cannot be evaluated in memory"),
        )),
    }
}
