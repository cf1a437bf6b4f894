//! Type definitions
//!
//! A type is a name and an ordered list of members. Each member has a
//! [`Signature`] and a body of stack-machine [`Op`]s. The serialized form
//! of a [`TypeDefinition`] is what a redefinition ships as the "new body".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Name of a type loaded (or to be loaded) in the runtime
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRef(String);

impl TypeRef {
    /// Create a type reference
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Type name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TypeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TypeRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of a runtime value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Unit,
    Bool,
    Int,
    Str,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unit => "unit",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Str => "str",
        })
    }
}

/// A runtime value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    /// Kind of this value
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Unit => ValueKind::Unit,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Str(_) => ValueKind::Str,
        }
    }

    /// String contents, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an integer
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Parameter and return kinds of a member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    pub ret: ValueKind,
}

impl Signature {
    /// Create a signature
    #[must_use]
    pub fn new(params: Vec<ValueKind>, ret: ValueKind) -> Self {
        Self { params, ret }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Stack-machine instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Push a constant
    Push(Value),
    /// Push the argument at this index
    Arg(u16),
    /// Pop two ints, push their sum
    Add,
    /// Pop two strings, push their concatenation
    Concat,
    /// Discard the top of the stack
    Pop,
    /// Pop the return value and finish
    Ret,
}

/// A member: name, signature and implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDef {
    pub name: String,
    pub signature: Signature,
    pub body: Vec<Op>,
}

/// A complete type definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: TypeRef,
    pub members: Vec<MemberDef>,
}

impl TypeDefinition {
    /// Definition with no members
    #[must_use]
    pub fn new(name: impl Into<TypeRef>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Builder-style member addition
    #[must_use]
    pub fn with_member(
        mut self,
        name: impl Into<String>,
        signature: Signature,
        body: impl Into<Vec<Op>>,
    ) -> Self {
        self.members.push(MemberDef {
            name: name.into(),
            signature,
            body: body.into(),
        });
        self
    }

    /// Look up a member by name
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&MemberDef> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Structural shape: member names and signatures
    #[must_use]
    pub fn shape(&self) -> TypeShape {
        TypeShape {
            members: self
                .members
                .iter()
                .map(|m| (m.name.clone(), m.signature.clone()))
                .collect(),
        }
    }

    /// Serialize to the byte form carried by redefinition requests
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the byte form
    ///
    /// # Errors
    /// Returns error if the bytes are not a serialized definition
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Member set of a type with signatures, independent of bodies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeShape {
    members: BTreeMap<String, Signature>,
}

impl TypeShape {
    /// Structural differences going from `self` to `next`
    ///
    /// Empty when only implementations differ.
    #[must_use]
    pub fn diff(&self, next: &TypeShape) -> Vec<ShapeChange> {
        let mut changes = Vec::new();
        for (name, before) in &self.members {
            match next.members.get(name) {
                None => changes.push(ShapeChange::MemberRemoved(name.clone())),
                Some(after) if after != before => changes.push(ShapeChange::SignatureChanged {
                    member: name.clone(),
                    before: before.clone(),
                    after: after.clone(),
                }),
                Some(_) => {}
            }
        }
        for name in next.members.keys() {
            if !self.members.contains_key(name) {
                changes.push(ShapeChange::MemberAdded(name.clone()));
            }
        }
        changes
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the type has no members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One structural difference between two definitions of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeChange {
    MemberAdded(String),
    MemberRemoved(String),
    SignatureChanged {
        member: String,
        before: Signature,
        after: Signature,
    },
}

impl Display for ShapeChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberAdded(m) => write!(f, "member `{m}` added"),
            Self::MemberRemoved(m) => write!(f, "member `{m}` removed"),
            Self::SignatureChanged {
                member,
                before,
                after,
            } => write!(f, "member `{member}` retyped {before} => {after}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn greeter(body: &str) -> TypeDefinition {
        TypeDefinition::new("demo.Greeter").with_member(
            "greet",
            Signature::new(vec![ValueKind::Str], ValueKind::Str),
            [Op::Push(body.into()), Op::Arg(0), Op::Concat, Op::Ret],
        )
    }

    #[test]
    fn bytes_decode_to_same_definition() {
        let def = greeter("Hello, ");
        let decoded = TypeDefinition::from_bytes(&def.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn body_change_keeps_shape() {
        let before = greeter("Hello, ").shape();
        let after = greeter("Howdy, ").shape();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn shape_diff_reports_every_change() {
        let before = greeter("Hello, ").with_member(
            "count",
            Signature::new(vec![], ValueKind::Int),
            [Op::Push(Value::Int(1)), Op::Ret],
        );
        let after = TypeDefinition::new("demo.Greeter")
            .with_member(
                "greet",
                Signature::new(vec![ValueKind::Str, ValueKind::Int], ValueKind::Str),
                [Op::Arg(0), Op::Ret],
            )
            .with_member("wave", Signature::new(vec![], ValueKind::Unit), [
                Op::Push(Value::Unit),
                Op::Ret,
            ]);

        let changes = before.shape().diff(&after.shape());
        assert_eq!(
            changes,
            vec![
                ShapeChange::MemberRemoved("count".to_string()),
                ShapeChange::SignatureChanged {
                    member: "greet".to_string(),
                    before: Signature::new(vec![ValueKind::Str], ValueKind::Str),
                    after: Signature::new(vec![ValueKind::Str, ValueKind::Int], ValueKind::Str),
                },
                ShapeChange::MemberAdded("wave".to_string()),
            ]
        );
    }

    #[test]
    fn signature_display() {
        let sig = Signature::new(vec![ValueKind::Int, ValueKind::Str], ValueKind::Bool);
        assert_eq!(sig.to_string(), "(int, str) -> bool");
    }
}
