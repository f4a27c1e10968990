//! Versioned binary encoding of per-class equation records.
//!
//! Members are stored as truncated hashes, so decoded records come back
//! in hashed form; the query session normalizes live keys the same way.
//! The format version must be bumped on any change to the inference
//! algorithm, which invalidates every previously persisted record.

use crate::errors::AnalysisError;
use crate::keys::{Direction, EKey, MEMBER_HASH_LEN, MemberId, HMember};
use crate::effects::{DataValue, EffectQuantum, Effects};
use crate::lattice::{Component, Equations, Pending, Rhs, Value};
use std::collections::BTreeSet;

pub const FORMAT_VERSION: u16 = 1;

const PENDING_MARK: i32 = Value::ALL.len() as i32;
const FIELD_ACCESS_MARK: i32 = PENDING_MARK + 1;

const QUANTUM_TOP: i32 = -1;
const QUANTUM_THIS: i32 = -2;
const QUANTUM_CALL: i32 = -3;
const QUANTUM_RETURN_CHANGE: i32 = -4;
const QUANTUM_FIELD_READ: i32 = -5;

const DATA_THIS: i32 = -1;
const DATA_LOCAL: i32 = -2;
const DATA_UNKNOWN: i32 = -3;
const DATA_UNKNOWN_WIDE: i32 = -4;
const DATA_RETURN: i32 = -5;

pub fn encode(records: &[Equations]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16(&mut out, FORMAT_VERSION);
    put_u32(&mut out, records.len() as u32);
    for record in records {
        out.extend_from_slice(&record.member.hashed().0);
        out.push(record.stable as u8);
        put_u16(&mut out, record.results.len() as u16);
        for (direction, rhs) in &record.results {
            put_u32(&mut out, *direction);
            match Direction::from_int(*direction) {
                Some(Direction::Pure | Direction::Volatile) => match rhs {
                    Rhs::Effects(effects) => put_effects(&mut out, effects),
                    // Degenerate rows still need a well-formed payload.
                    _ => put_effects(&mut out, &Effects::top()),
                },
                _ => put_rhs(&mut out, rhs),
            }
        }
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Equations>, AnalysisError> {
    let mut reader = Reader { bytes, pos: 0 };
    let version = reader.u16()?;
    if version != FORMAT_VERSION {
        return Err(AnalysisError::WrongVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let count = reader.u32()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let member = MemberId::Hashed(reader.hash()?);
        let stable = reader.u8()? != 0;
        let results = reader.u16()? as usize;
        let mut decoded = Vec::with_capacity(results);
        for _ in 0..results {
            let direction = reader.u32()?;
            let rhs = match Direction::from_int(direction) {
                Some(Direction::Pure | Direction::Volatile) => {
                    Rhs::Effects(reader.effects()?)
                }
                Some(_) => reader.rhs()?,
                None => {
                    return Err(AnalysisError::Corrupt(format!(
                        "unknown direction {direction}"
                    )));
                }
            };
            decoded.push((direction, rhs));
        }
        records.push(Equations {
            member,
            stable,
            results: decoded,
        });
    }
    if reader.pos != bytes.len() {
        return Err(AnalysisError::Corrupt(format!(
            "{} trailing bytes",
            bytes.len() - reader.pos
        )));
    }
    Ok(records)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

// Hash bytes, then the direction int with the negation folded into the
// sign bit, then the stability byte.
fn put_key(out: &mut Vec<u8>, key: &EKey) {
    out.extend_from_slice(&key.member.hashed().0);
    let direction = key.direction.as_int() as i32 + 1;
    put_i32(out, if key.negated { -direction } else { direction });
    out.push(key.stable as u8);
}

fn put_rhs(out: &mut Vec<u8>, rhs: &Rhs) {
    match rhs {
        Rhs::Value(value) => put_i32(out, value.ordinal() as i32),
        Rhs::Pending(pending) => {
            put_i32(out, PENDING_MARK);
            put_u16(out, pending.sum.len() as u16);
            for component in &pending.sum {
                put_i32(out, component.value.ordinal() as i32);
                put_u16(out, component.ids.len() as u16);
                for id in &component.ids {
                    put_key(out, id);
                }
            }
        }
        Rhs::FieldAccess(field) => {
            put_i32(out, FIELD_ACCESS_MARK);
            put_u16(out, field.len() as u16);
            out.extend_from_slice(field.as_bytes());
        }
        // Effects travel only under the Pure/Volatile directions.
        Rhs::Effects(_) => put_i32(out, PENDING_MARK - 1),
    }
}

fn put_data_value(out: &mut Vec<u8>, value: &DataValue) {
    match value {
        DataValue::This => put_i32(out, DATA_THIS),
        DataValue::Local => put_i32(out, DATA_LOCAL),
        DataValue::Unknown { wide: false } => put_i32(out, DATA_UNKNOWN),
        DataValue::Unknown { wide: true } => put_i32(out, DATA_UNKNOWN_WIDE),
        DataValue::Return(key) => {
            put_i32(out, DATA_RETURN);
            put_key(out, key);
        }
        DataValue::Parameter(param) => put_i32(out, *param as i32),
    }
}

fn put_effects(out: &mut Vec<u8>, effects: &Effects) {
    put_u16(out, effects.quanta.len() as u16);
    for quantum in &effects.quanta {
        match quantum {
            EffectQuantum::Top => put_i32(out, QUANTUM_TOP),
            EffectQuantum::ThisChange => put_i32(out, QUANTUM_THIS),
            EffectQuantum::Call {
                key,
                is_static,
                args,
            } => {
                put_i32(out, QUANTUM_CALL);
                put_key(out, key);
                out.push(*is_static as u8);
                put_u16(out, args.len() as u16);
                for arg in args {
                    put_data_value(out, arg);
                }
            }
            EffectQuantum::ReturnChange(key) => {
                put_i32(out, QUANTUM_RETURN_CHANGE);
                put_key(out, key);
            }
            EffectQuantum::FieldRead(key) => {
                put_i32(out, QUANTUM_FIELD_READ);
                put_key(out, key);
            }
            EffectQuantum::ParamChange(param) => put_i32(out, *param as i32),
        }
    }
    put_data_value(out, &effects.return_value);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], AnalysisError> {
        if self.pos + len > self.bytes.len() {
            return Err(AnalysisError::Corrupt(format!(
                "truncated record at offset {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AnalysisError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AnalysisError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, AnalysisError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, AnalysisError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn hash(&mut self) -> Result<HMember, AnalysisError> {
        let bytes = self.take(MEMBER_HASH_LEN)?;
        let mut hash = [0u8; MEMBER_HASH_LEN];
        hash.copy_from_slice(bytes);
        Ok(HMember(hash))
    }

    fn key(&mut self) -> Result<EKey, AnalysisError> {
        let member = MemberId::Hashed(self.hash()?);
        let raw = self.i32()?;
        if raw == 0 {
            return Err(AnalysisError::Corrupt("zero direction in key".to_string()));
        }
        let negated = raw < 0;
        let direction = Direction::from_int(raw.unsigned_abs() - 1)
            .ok_or_else(|| AnalysisError::Corrupt(format!("unknown key direction {raw}")))?;
        let stable = self.u8()? != 0;
        let mut key = EKey::new(member, direction, stable);
        if negated {
            key = key.negate();
        }
        Ok(key)
    }

    fn value(&mut self, ordinal: i32) -> Result<Value, AnalysisError> {
        u32::try_from(ordinal)
            .ok()
            .and_then(Value::from_ordinal)
            .ok_or_else(|| AnalysisError::Corrupt(format!("bad value ordinal {ordinal}")))
    }

    fn rhs(&mut self) -> Result<Rhs, AnalysisError> {
        let mark = self.i32()?;
        if mark == PENDING_MARK {
            let components = self.u16()? as usize;
            let mut sum = Vec::with_capacity(components);
            for _ in 0..components {
                let ordinal = self.i32()?;
                let value = self.value(ordinal)?;
                let count = self.u16()? as usize;
                let mut ids = BTreeSet::new();
                for _ in 0..count {
                    ids.insert(self.key()?);
                }
                sum.push(Component::new(value, ids));
            }
            Ok(Rhs::Pending(Pending::new(sum)))
        } else if mark == FIELD_ACCESS_MARK {
            let len = self.u16()? as usize;
            let field = String::from_utf8(self.take(len)?.to_vec())
                .map_err(|err| AnalysisError::Corrupt(format!("field name: {err}")))?;
            Ok(Rhs::FieldAccess(field))
        } else {
            Ok(Rhs::Value(self.value(mark)?))
        }
    }

    fn data_value(&mut self) -> Result<DataValue, AnalysisError> {
        let mark = self.i32()?;
        match mark {
            DATA_THIS => Ok(DataValue::This),
            DATA_LOCAL => Ok(DataValue::Local),
            DATA_UNKNOWN => Ok(DataValue::Unknown { wide: false }),
            DATA_UNKNOWN_WIDE => Ok(DataValue::Unknown { wide: true }),
            DATA_RETURN => Ok(DataValue::Return(self.key()?)),
            n if n >= 0 => Ok(DataValue::Parameter(n as u16)),
            other => Err(AnalysisError::Corrupt(format!(
                "unknown data value discriminator {other}"
            ))),
        }
    }

    fn effects(&mut self) -> Result<Effects, AnalysisError> {
        let count = self.u16()? as usize;
        let mut quanta = BTreeSet::new();
        for _ in 0..count {
            let mark = self.i32()?;
            let quantum = match mark {
                QUANTUM_TOP => EffectQuantum::Top,
                QUANTUM_THIS => EffectQuantum::ThisChange,
                QUANTUM_CALL => {
                    let key = self.key()?;
                    let is_static = self.u8()? != 0;
                    let args = self.u16()? as usize;
                    let mut decoded = Vec::with_capacity(args);
                    for _ in 0..args {
                        decoded.push(self.data_value()?);
                    }
                    EffectQuantum::Call {
                        key,
                        is_static,
                        args: decoded,
                    }
                }
                QUANTUM_RETURN_CHANGE => EffectQuantum::ReturnChange(self.key()?),
                QUANTUM_FIELD_READ => EffectQuantum::FieldRead(self.key()?),
                n if n >= 0 => EffectQuantum::ParamChange(n as u16),
                other => {
                    return Err(AnalysisError::Corrupt(format!(
                        "unknown effect discriminator {other}"
                    )));
                }
            };
            quanta.insert(quantum);
        }
        let return_value = self.data_value()?;
        Ok(Effects::new(return_value, quanta))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{decode, encode};
    use crate::effects::{DataValue, EffectQuantum, Effects};
    use crate::errors::AnalysisError;
    use crate::keys::{Direction, EKey, Member, MemberId, ParamConstraint};
    use crate::lattice::{Component, Equations, Pending, Rhs, STANDARD, Value};

    fn member(name: &str) -> Member {
        Member::new("com/acme/Widget", name, "(Ljava/lang/Object;)Z")
    }

    fn sample() -> Vec<Equations> {
        let dep = EKey::new(
            MemberId::from(member("delegate")),
            Direction::InOut {
                param: 0,
                constraint: ParamConstraint::Null,
            },
            true,
        )
        .negate();
        vec![
            Equations {
                member: MemberId::from(member("f")),
                stable: true,
                results: vec![
                    (Direction::Out.as_int(), Rhs::Value(Value::True)),
                    (
                        Direction::Throw.as_int(),
                        Rhs::Pending(Pending::single(Component::new(
                            STANDARD.top,
                            BTreeSet::from([dep]),
                        ))),
                    ),
                    (
                        Direction::Pure.as_int(),
                        Rhs::Effects(Effects::new(
                            DataValue::Parameter(0),
                            BTreeSet::from([EffectQuantum::ThisChange]),
                        )),
                    ),
                    (
                        Direction::Access.as_int(),
                        Rhs::FieldAccess("size".to_string()),
                    ),
                ],
            },
            Equations {
                member: MemberId::from(member("g")),
                stable: false,
                results: vec![(
                    Direction::Pure.as_int(),
                    Rhs::Effects(Effects::new(
                        DataValue::unknown(false),
                        BTreeSet::from([EffectQuantum::Call {
                            key: EKey::new(
                                MemberId::from(member("f")),
                                Direction::Pure,
                                true,
                            ),
                            is_static: false,
                            args: vec![DataValue::This, DataValue::Parameter(0)],
                        }]),
                    )),
                )],
            },
        ]
    }

    // Members hash on the way out, so compare against the hashed form.
    fn hashed(records: Vec<Equations>) -> Vec<Equations> {
        records
            .into_iter()
            .map(|record| Equations {
                member: MemberId::Hashed(record.member.hashed()),
                stable: record.stable,
                results: record
                    .results
                    .into_iter()
                    .map(|(direction, rhs)| {
                        let rhs = match &rhs {
                            Rhs::Effects(effects) => {
                                Rhs::Effects(crate::solve::hash_effects(effects))
                            }
                            other => crate::solve::hash_rhs(other),
                        };
                        (direction, rhs)
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn records_survive_a_round_trip() {
        let records = sample();
        let decoded = decode(&encode(&records)).expect("decode");
        assert_eq!(decoded, hashed(records));
    }

    #[test]
    fn version_mismatch_is_detected() {
        let mut bytes = encode(&sample());
        bytes[1] = bytes[1].wrapping_add(1);
        assert!(matches!(
            decode(&bytes),
            Err(AnalysisError::WrongVersion { .. })
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let bytes = encode(&sample());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 3]),
            Err(AnalysisError::Corrupt(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_detected() {
        let mut bytes = encode(&sample());
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(AnalysisError::Corrupt(_))));
    }
}
