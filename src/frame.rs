//! Symbolic execution of one instruction against an operand frame.
//!
//! The frame holds logical values: a two-slot long or double is a single
//! entry that reports itself wide. The untyped stack instructions (`pop2`,
//! the `dup` family) consult value width to reproduce slot semantics.

use crate::descriptor::{ReturnShape, TypeShape, method_arg_shapes, method_return_shape, type_shape};
use crate::errors::AnalysisError;
use crate::ir::{CallKind, Const, Insn, Member};

/// Locals and operand stack at one instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame<V> {
    pub locals: Vec<V>,
    pub stack: Vec<V>,
}

impl<V: Clone + Default> Frame<V> {
    pub fn new() -> Frame<V> {
        Frame {
            locals: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn local(&self, slot: u16) -> V {
        self.locals.get(usize::from(slot)).cloned().unwrap_or_default()
    }

    pub fn set_local(&mut self, slot: u16, value: V) {
        let slot = usize::from(slot);
        if slot >= self.locals.len() {
            self.locals.resize_with(slot + 1, V::default);
        }
        self.locals[slot] = value;
    }

    pub fn push(&mut self, value: V) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<V, AnalysisError> {
        self.stack
            .pop()
            .ok_or_else(|| AnalysisError::Malformed("operand stack underflow".to_string()))
    }

    pub fn top(&self) -> Result<&V, AnalysisError> {
        self.stack
            .last()
            .ok_or_else(|| AnalysisError::Malformed("operand stack underflow".to_string()))
    }

    pub fn under_top(&self) -> Result<&V, AnalysisError> {
        self.stack
            .len()
            .checked_sub(2)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(|| AnalysisError::Malformed("operand stack underflow".to_string()))
    }
}

impl<V: Clone + Default> Default for Frame<V> {
    fn default() -> Frame<V> {
        Frame::new()
    }
}

/// Per-analysis hooks invoked while an instruction executes. Defaults
/// produce untracked values of the right width, so an analysis overrides
/// only the instructions it draws meaning from.
pub trait Interpreter {
    type Value: Clone + Default;

    fn untracked(&self, wide: bool) -> Self::Value;
    fn is_wide(&self, value: &Self::Value) -> bool;

    fn constant(&mut self, constant: &Const) -> Self::Value {
        self.untracked(constant.wide())
    }

    fn load(&mut self, _slot: u16, value: &Self::Value) -> Self::Value {
        value.clone()
    }

    /// One operand consumed, one result produced (negation, conversions,
    /// `instanceof`, `checkcast`, `arraylength`, `newarray`).
    fn unary(&mut self, _insn: &Insn, _value: &Self::Value, wide: bool) -> Self::Value {
        self.untracked(wide)
    }

    /// Two operands consumed, one result produced (arithmetic, compares,
    /// array loads).
    fn binary(
        &mut self,
        _insn: &Insn,
        _left: &Self::Value,
        _right: &Self::Value,
        wide: bool,
    ) -> Self::Value {
        self.untracked(wide)
    }

    /// Array store; consumes three operands, produces nothing.
    fn ternary(
        &mut self,
        _insn: &Insn,
        _array: &Self::Value,
        _index: &Self::Value,
        _value: &Self::Value,
    ) {
    }

    /// `args` includes the receiver for instance calls.
    fn call(
        &mut self,
        _kind: CallKind,
        _method: &Member,
        _args: Vec<Self::Value>,
        result: ReturnShape,
    ) -> Result<Option<Self::Value>, AnalysisError> {
        Ok(match result {
            ReturnShape::Void => None,
            ReturnShape::Value(shape) => Some(self.untracked(shape == TypeShape::Wide)),
        })
    }

    fn invoke_dynamic(
        &mut self,
        _descriptor: &str,
        _args: Vec<Self::Value>,
        result: ReturnShape,
    ) -> Option<Self::Value> {
        match result {
            ReturnShape::Void => None,
            ReturnShape::Value(shape) => Some(self.untracked(shape == TypeShape::Wide)),
        }
    }

    fn get_field(
        &mut self,
        _field: &Member,
        _receiver: Option<&Self::Value>,
        wide: bool,
    ) -> Self::Value {
        self.untracked(wide)
    }

    fn put_field(
        &mut self,
        _field: &Member,
        _receiver: Option<&Self::Value>,
        _value: &Self::Value,
    ) {
    }

    fn new_object(&mut self, _class: &str) -> Self::Value {
        self.untracked(false)
    }

    fn new_array(&mut self) -> Self::Value {
        self.untracked(false)
    }

    /// A value consumed by an instruction with no result on the stack:
    /// branch conditions, returns, `athrow`, monitor operations.
    fn sink(&mut self, _insn: &Insn, _value: &Self::Value) {}
}

fn malformed(what: &str) -> AnalysisError {
    AnalysisError::Malformed(what.to_string())
}

fn shape_error(err: anyhow::Error) -> AnalysisError {
    AnalysisError::Malformed(format!("{err:#}"))
}

/// Pops one two-slot block: a single wide value or two narrow values,
/// returned bottom to top.
fn pop_block<I: Interpreter>(
    frame: &mut Frame<I::Value>,
    interp: &I,
) -> Result<Vec<I::Value>, AnalysisError> {
    let top = frame.pop()?;
    if interp.is_wide(&top) {
        Ok(vec![top])
    } else {
        let under = frame.pop()?;
        Ok(vec![under, top])
    }
}

fn push_all<V: Clone + Default>(frame: &mut Frame<V>, values: &[V]) {
    for value in values {
        frame.push(value.clone());
    }
}

/// Executes `insn` against `frame`, routing meaning through `interp`.
pub fn execute<I: Interpreter>(
    frame: &mut Frame<I::Value>,
    insn: &Insn,
    interp: &mut I,
) -> Result<(), AnalysisError> {
    match insn {
        Insn::Nop | Insn::Goto { .. } => {}
        Insn::Push(constant) => {
            let value = interp.constant(constant);
            frame.push(value);
        }
        Insn::Load { slot, .. } => {
            let value = frame.local(*slot);
            let value = interp.load(*slot, &value);
            frame.push(value);
        }
        Insn::Store { slot, wide } => {
            let value = frame.pop()?;
            frame.set_local(*slot, value);
            if *wide {
                frame.set_local(*slot + 1, I::Value::default());
            }
        }
        Insn::ArrayLoad { wide, .. } => {
            let index = frame.pop()?;
            let array = frame.pop()?;
            let result = interp.binary(insn, &array, &index, *wide);
            frame.push(result);
        }
        Insn::ArrayStore { .. } => {
            let value = frame.pop()?;
            let index = frame.pop()?;
            let array = frame.pop()?;
            interp.ternary(insn, &array, &index, &value);
        }
        Insn::Pop => {
            frame.pop()?;
        }
        Insn::Pop2 => {
            pop_block(frame, interp)?;
        }
        Insn::Dup => {
            let top = frame.top()?.clone();
            frame.push(top);
        }
        Insn::DupX1 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            push_all(frame, &[v1.clone(), v2, v1]);
        }
        Insn::DupX2 => {
            let v1 = frame.pop()?;
            let block = pop_block(frame, interp)?;
            frame.push(v1.clone());
            push_all(frame, &block);
            frame.push(v1);
        }
        Insn::Dup2 => {
            let block = pop_block(frame, interp)?;
            push_all(frame, &block);
            push_all(frame, &block);
        }
        Insn::Dup2X1 => {
            let block = pop_block(frame, interp)?;
            let under = frame.pop()?;
            push_all(frame, &block);
            frame.push(under);
            push_all(frame, &block);
        }
        Insn::Dup2X2 => {
            let upper = pop_block(frame, interp)?;
            let lower = pop_block(frame, interp)?;
            push_all(frame, &upper);
            push_all(frame, &lower);
            push_all(frame, &upper);
        }
        Insn::Swap => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            frame.push(v1);
            frame.push(v2);
        }
        Insn::Arith { op, wide } => {
            if op.operand_count() == 1 {
                let value = frame.pop()?;
                let result = interp.unary(insn, &value, *wide);
                frame.push(result);
            } else {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let result = interp.binary(insn, &left, &right, *wide);
                frame.push(result);
            }
        }
        Insn::Iinc { slot, .. } => {
            let value = interp.untracked(false);
            frame.set_local(*slot, value);
        }
        Insn::Convert { to_wide } => {
            let value = frame.pop()?;
            let result = interp.unary(insn, &value, *to_wide);
            frame.push(result);
        }
        Insn::Cmp { .. } => {
            let right = frame.pop()?;
            let left = frame.pop()?;
            let result = interp.binary(insn, &left, &right, false);
            frame.push(result);
        }
        Insn::If { .. } | Insn::Switch { .. } => {
            let value = frame.pop()?;
            interp.sink(insn, &value);
        }
        Insn::IfCmp { .. } => {
            let right = frame.pop()?;
            let left = frame.pop()?;
            interp.sink(insn, &left);
            interp.sink(insn, &right);
        }
        Insn::Return { kind } => {
            if !matches!(kind, crate::ir::ReturnKind::Void) {
                let value = frame.pop()?;
                interp.sink(insn, &value);
            }
        }
        Insn::Throw | Insn::MonitorEnter | Insn::MonitorExit => {
            let value = frame.pop()?;
            interp.sink(insn, &value);
        }
        Insn::GetField { field, is_static } => {
            let receiver = if *is_static { None } else { Some(frame.pop()?) };
            let wide = type_shape(&field.descriptor).map_err(shape_error)? == TypeShape::Wide;
            let result = interp.get_field(field, receiver.as_ref(), wide);
            frame.push(result);
        }
        Insn::PutField { field, is_static } => {
            let value = frame.pop()?;
            let receiver = if *is_static { None } else { Some(frame.pop()?) };
            interp.put_field(field, receiver.as_ref(), &value);
        }
        Insn::Invoke { kind, method } => {
            let shapes = method_arg_shapes(&method.descriptor).map_err(shape_error)?;
            let mut args = Vec::with_capacity(shapes.len() + 1);
            for _ in &shapes {
                args.push(frame.pop()?);
            }
            if *kind != CallKind::Static {
                args.push(frame.pop()?);
            }
            args.reverse();
            let result = method_return_shape(&method.descriptor).map_err(shape_error)?;
            if let Some(value) = interp.call(*kind, method, args, result)? {
                frame.push(value);
            }
        }
        Insn::InvokeDynamic { descriptor } => {
            let shapes = method_arg_shapes(descriptor).map_err(shape_error)?;
            let mut args = Vec::with_capacity(shapes.len());
            for _ in &shapes {
                args.push(frame.pop()?);
            }
            args.reverse();
            let result = method_return_shape(descriptor).map_err(shape_error)?;
            if let Some(value) = interp.invoke_dynamic(descriptor, args, result) {
                frame.push(value);
            }
        }
        Insn::New { class } => {
            let value = interp.new_object(class);
            frame.push(value);
        }
        Insn::NewArray => {
            let count = frame.pop()?;
            let result = interp.unary(insn, &count, false);
            frame.push(result);
        }
        Insn::MultiNewArray { dims } => {
            if *dims == 0 {
                return Err(malformed("multianewarray with zero dimensions"));
            }
            for _ in 0..*dims {
                frame.pop()?;
            }
            let value = interp.new_array();
            frame.push(value);
        }
        Insn::ArrayLength | Insn::CheckCast { .. } | Insn::InstanceOf { .. } => {
            let value = frame.pop()?;
            let result = interp.unary(insn, &value, false);
            frame.push(result);
        }
    }
    Ok(())
}
