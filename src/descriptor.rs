use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Shape of one declared type as the analysis cares about it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeShape {
    Reference,
    Boolean,
    /// Any other one-slot primitive.
    Word,
    /// Two-slot primitive (long/double).
    Wide,
}

impl TypeShape {
    pub fn is_reference(self) -> bool {
        self == TypeShape::Reference
    }

    pub fn slots(self) -> u16 {
        if self == TypeShape::Wide { 2 } else { 1 }
    }
}

/// Return shape of a method.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnShape {
    Void,
    Value(TypeShape),
}

fn shape_of(descriptor: &TypeDescriptor) -> TypeShape {
    match descriptor {
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => TypeShape::Reference,
        TypeDescriptor::Long | TypeDescriptor::Double => TypeShape::Wide,
        TypeDescriptor::Boolean => TypeShape::Boolean,
        _ => TypeShape::Word,
    }
}

/// Count parameters in a JVM method descriptor.
pub fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Shapes of all declared parameters, in order.
pub fn method_arg_shapes(descriptor: &str) -> Result<Vec<TypeShape>> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().iter().map(shape_of).collect())
}

/// Return shape of a method descriptor.
pub fn method_return_shape(descriptor: &str) -> Result<ReturnShape> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let shape = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnShape::Void,
        other => ReturnShape::Value(shape_of(other)),
    };
    Ok(shape)
}

/// Local-variable slot of each parameter, accounting for the receiver slot
/// of instance methods and two-slot primitives.
pub fn method_arg_slots(descriptor: &str, is_static: bool) -> Result<Vec<u16>> {
    let shapes = method_arg_shapes(descriptor)?;
    let mut slots = Vec::with_capacity(shapes.len());
    let mut next = if is_static { 0u16 } else { 1u16 };
    for shape in shapes {
        slots.push(next);
        next += shape.slots();
    }
    Ok(slots)
}

/// Shape of a single field/type descriptor. Reuses the method-descriptor
/// grammar so only one parser is involved.
pub fn type_shape(descriptor: &str) -> Result<TypeShape> {
    let wrapped = format!("(){descriptor}");
    let parsed = MethodDescriptor::from_str(&wrapped).context("parse type descriptor")?;
    Ok(shape_of(parsed.return_type()))
}
