//! Body verifier
//!
//! Every definition is verified before it becomes loadable, both on first
//! definition and on redefinition. Verification simulates the operand stack
//! by kind, so a verified body can never underflow, confuse operand kinds or
//! return the wrong kind at run time.

use crate::model::{MemberDef, Op, TypeDefinition, ValueKind};
use std::collections::HashSet;

/// Maximum operand stack depth a body may reach
pub const MAX_STACK_DEPTH: usize = 256;

/// Verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("member `{member}`: {kind}")]
pub struct VerifyError {
    pub member: String,
    pub kind: VerifyErrorKind,
}

/// What made a body unverifiable
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyErrorKind {
    #[error("type name is empty")]
    EmptyTypeName,

    #[error("member name is empty")]
    EmptyMemberName,

    #[error("member is defined more than once")]
    DuplicateMember,

    #[error("body does not end with `ret`")]
    MissingReturn,

    #[error("instruction {pc} follows `ret`")]
    UnreachableCode { pc: usize },

    #[error("instruction {pc} pops from an empty stack")]
    StackUnderflow { pc: usize },

    #[error("instruction {pc} exceeds the maximum stack depth")]
    StackOverflow { pc: usize },

    #[error("instruction {pc} reads argument {index} but only {arity} are declared")]
    ArgumentOutOfRange { pc: usize, index: u16, arity: usize },

    #[error("instruction {pc} expected {expected} operand, found {found}")]
    OperandKind {
        pc: usize,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("returns {found} but signature declares {expected}")]
    ReturnKind { expected: ValueKind, found: ValueKind },

    #[error("{depth} values left on the stack at `ret`")]
    LeftoverStack { depth: usize },
}

/// Verify every member of a definition
///
/// # Errors
/// Returns the first failure found, in member order
pub fn verify_definition(def: &TypeDefinition) -> Result<(), VerifyError> {
    if def.name.as_str().is_empty() {
        return Err(VerifyError {
            member: String::new(),
            kind: VerifyErrorKind::EmptyTypeName,
        });
    }
    let mut seen = HashSet::new();
    for member in &def.members {
        if !seen.insert(member.name.as_str()) {
            return Err(fail(member, VerifyErrorKind::DuplicateMember));
        }
        verify_member(member)?;
    }
    Ok(())
}

/// Verify a single member body against its signature
///
/// # Errors
/// Returns error if the body is not well-formed
pub fn verify_member(member: &MemberDef) -> Result<(), VerifyError> {
    if member.name.is_empty() {
        return Err(fail(member, VerifyErrorKind::EmptyMemberName));
    }
    if member.body.last() != Some(&Op::Ret) {
        return Err(fail(member, VerifyErrorKind::MissingReturn));
    }

    let params = &member.signature.params;
    let mut stack: Vec<ValueKind> = Vec::new();
    let last = member.body.len() - 1;

    for (pc, op) in member.body.iter().enumerate() {
        match op {
            Op::Push(value) => push(member, &mut stack, pc, value.kind())?,
            Op::Arg(index) => {
                let kind = params.get(usize::from(*index)).copied().ok_or_else(|| {
                    fail(
                        member,
                        VerifyErrorKind::ArgumentOutOfRange {
                            pc,
                            index: *index,
                            arity: params.len(),
                        },
                    )
                })?;
                push(member, &mut stack, pc, kind)?;
            }
            Op::Add => binary(member, &mut stack, pc, ValueKind::Int)?,
            Op::Concat => binary(member, &mut stack, pc, ValueKind::Str)?,
            Op::Pop => {
                pop(member, &mut stack, pc)?;
            }
            Op::Ret => {
                if pc != last {
                    return Err(fail(member, VerifyErrorKind::UnreachableCode { pc: pc + 1 }));
                }
                let found = pop(member, &mut stack, pc)?;
                let expected = member.signature.ret;
                if found != expected {
                    return Err(fail(member, VerifyErrorKind::ReturnKind { expected, found }));
                }
                if !stack.is_empty() {
                    return Err(fail(
                        member,
                        VerifyErrorKind::LeftoverStack { depth: stack.len() },
                    ));
                }
            }
        }
    }
    Ok(())
}

fn fail(member: &MemberDef, kind: VerifyErrorKind) -> VerifyError {
    VerifyError {
        member: member.name.clone(),
        kind,
    }
}

fn push(
    member: &MemberDef,
    stack: &mut Vec<ValueKind>,
    pc: usize,
    kind: ValueKind,
) -> Result<(), VerifyError> {
    if stack.len() >= MAX_STACK_DEPTH {
        return Err(fail(member, VerifyErrorKind::StackOverflow { pc }));
    }
    stack.push(kind);
    Ok(())
}

fn pop(
    member: &MemberDef,
    stack: &mut Vec<ValueKind>,
    pc: usize,
) -> Result<ValueKind, VerifyError> {
    stack
        .pop()
        .ok_or_else(|| fail(member, VerifyErrorKind::StackUnderflow { pc }))
}

fn binary(
    member: &MemberDef,
    stack: &mut Vec<ValueKind>,
    pc: usize,
    operand: ValueKind,
) -> Result<(), VerifyError> {
    for _ in 0..2 {
        let found = pop(member, stack, pc)?;
        if found != operand {
            return Err(fail(
                member,
                VerifyErrorKind::OperandKind {
                    pc,
                    expected: operand,
                    found,
                },
            ));
        }
    }
    stack.push(operand);
    Ok(())
}
