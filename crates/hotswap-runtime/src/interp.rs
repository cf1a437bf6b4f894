//! Member interpreter
//!
//! Runs verified bodies. The checks here only guard against bodies that
//! bypassed verification; a verified body reaches `Ret` with exactly one
//! value of the declared kind.

use crate::model::{MemberDef, Op, TypeRef, Value};

/// Invocation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("type `{0}` is not loaded")]
    TypeNotLoaded(TypeRef),

    #[error("type `{ty}` has no member `{member}`")]
    NoSuchMember { ty: TypeRef, member: String },

    #[error("`{member}` expects {expected}, got ({found})")]
    ArgumentMismatch {
        member: String,
        expected: String,
        found: String,
    },

    #[error("integer overflow at instruction {pc}")]
    Overflow { pc: usize },

    #[error("corrupted body at instruction {pc}")]
    Corrupted { pc: usize },
}

/// Execute `member` with `args`
///
/// # Errors
/// Returns error on an argument mismatch, integer overflow or a body that
/// did not pass verification
pub fn execute(member: &MemberDef, args: &[Value]) -> Result<Value, InvokeError> {
    check_args(member, args)?;

    let mut stack: Vec<Value> = Vec::new();
    for (pc, op) in member.body.iter().enumerate() {
        match op {
            Op::Push(value) => stack.push(value.clone()),
            Op::Arg(index) => {
                let arg = args
                    .get(usize::from(*index))
                    .ok_or(InvokeError::Corrupted { pc })?;
                stack.push(arg.clone());
            }
            Op::Add => {
                let (a, b) = pop2(&mut stack, pc)?;
                match (a, b) {
                    (Value::Int(a), Value::Int(b)) => {
                        let sum = a.checked_add(b).ok_or(InvokeError::Overflow { pc })?;
                        stack.push(Value::Int(sum));
                    }
                    _ => return Err(InvokeError::Corrupted { pc }),
                }
            }
            Op::Concat => {
                let (a, b) = pop2(&mut stack, pc)?;
                match (a, b) {
                    (Value::Str(mut a), Value::Str(b)) => {
                        a.push_str(&b);
                        stack.push(Value::Str(a));
                    }
                    _ => return Err(InvokeError::Corrupted { pc }),
                }
            }
            Op::Pop => {
                stack.pop().ok_or(InvokeError::Corrupted { pc })?;
            }
            Op::Ret => return stack.pop().ok_or(InvokeError::Corrupted { pc }),
        }
    }
    Err(InvokeError::Corrupted {
        pc: member.body.len(),
    })
}

/// Pops `b` then `a`, returning them in push order
fn pop2(stack: &mut Vec<Value>, pc: usize) -> Result<(Value, Value), InvokeError> {
    let b = stack.pop().ok_or(InvokeError::Corrupted { pc })?;
    let a = stack.pop().ok_or(InvokeError::Corrupted { pc })?;
    Ok((a, b))
}

fn check_args(member: &MemberDef, args: &[Value]) -> Result<(), InvokeError> {
    let params = &member.signature.params;
    let matches = params.len() == args.len()
        && params.iter().zip(args).all(|(p, a)| *p == a.kind());
    if matches {
        return Ok(());
    }
    let found = args
        .iter()
        .map(|a| a.kind().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(InvokeError::ArgumentMismatch {
        member: member.name.clone(),
        expected: member.signature.to_string(),
        found,
    })
}
