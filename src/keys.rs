use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bytes kept from a member's SHA-256 digest in compact keys.
pub const MEMBER_HASH_LEN: usize = 10;

/// Fully qualified class member: owner internal name, member name and
/// JVM descriptor.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Member {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl Member {
    pub fn new(owner: &str, name: &str, descriptor: &str) -> Member {
        Member {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    /// Digest of owner, name and descriptor separated by zero bytes,
    /// truncated to [`MEMBER_HASH_LEN`] bytes.
    pub fn hashed(&self) -> HMember {
        let mut hasher = Sha256::new();
        hasher.update(self.owner.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.descriptor.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; MEMBER_HASH_LEN];
        bytes.copy_from_slice(&digest[..MEMBER_HASH_LEN]);
        HMember(bytes)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Truncated digest of a member, used once equations leave the class they
/// were inferred from.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct HMember(pub [u8; MEMBER_HASH_LEN]);

impl fmt::Debug for HMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A member reference, either spelled out or hashed.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum MemberId {
    Full(Member),
    Hashed(HMember),
}

impl MemberId {
    pub fn hashed(&self) -> HMember {
        match self {
            MemberId::Full(member) => member.hashed(),
            MemberId::Hashed(hashed) => *hashed,
        }
    }
}

impl From<Member> for MemberId {
    fn from(member: Member) -> MemberId {
        MemberId::Full(member)
    }
}

impl From<HMember> for MemberId {
    fn from(hashed: HMember) -> MemberId {
        MemberId::Hashed(hashed)
    }
}

/// Assumption about a parameter under which a conditional fact holds.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum ParamConstraint {
    NotNull,
    Null,
    True,
    False,
}

impl ParamConstraint {
    pub const ALL: [ParamConstraint; 4] = [
        ParamConstraint::NotNull,
        ParamConstraint::Null,
        ParamConstraint::True,
        ParamConstraint::False,
    ];

    pub fn ordinal(self) -> u32 {
        match self {
            ParamConstraint::NotNull => 0,
            ParamConstraint::Null => 1,
            ParamConstraint::True => 2,
            ParamConstraint::False => 3,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<ParamConstraint> {
        ParamConstraint::ALL.get(ordinal as usize).copied()
    }
}

const PARAM_BASE: u32 = 6;
const PER_PARAM: u32 = 10;

/// What a key asserts about its member. Parameterless directions describe
/// the member as a whole; parameterized ones describe one argument or the
/// member's behavior under an assumption about one argument.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Direction {
    /// Return value in general.
    Out,
    /// Return value under the nullable lattice.
    NullableOut,
    /// Side effects of the member.
    Pure,
    /// Whether the member always throws.
    Throw,
    /// Field volatility.
    Volatile,
    /// Trivial field accessor.
    Access,
    /// Nullability demands on one parameter.
    In { param: u16, nullable: bool },
    /// Return value when one parameter satisfies a constraint.
    InOut { param: u16, constraint: ParamConstraint },
    /// Always-throws when one parameter satisfies a constraint.
    InThrow { param: u16, constraint: ParamConstraint },
}

impl Direction {
    /// Lossless integer encoding, used by serialized keys and for compact
    /// sorting.
    pub fn as_int(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::NullableOut => 1,
            Direction::Pure => 2,
            Direction::Throw => 3,
            Direction::Volatile => 4,
            Direction::Access => 5,
            Direction::In { param, nullable } => {
                PARAM_BASE + PER_PARAM * u32::from(param) + u32::from(nullable)
            }
            Direction::InOut { param, constraint } => {
                PARAM_BASE + PER_PARAM * u32::from(param) + 2 + constraint.ordinal()
            }
            Direction::InThrow { param, constraint } => {
                PARAM_BASE + PER_PARAM * u32::from(param) + 6 + constraint.ordinal()
            }
        }
    }

    pub fn from_int(value: u32) -> Option<Direction> {
        match value {
            0 => Some(Direction::Out),
            1 => Some(Direction::NullableOut),
            2 => Some(Direction::Pure),
            3 => Some(Direction::Throw),
            4 => Some(Direction::Volatile),
            5 => Some(Direction::Access),
            _ => {
                let offset = value - PARAM_BASE;
                let param = u16::try_from(offset / PER_PARAM).ok()?;
                match offset % PER_PARAM {
                    slot @ 0..=1 => Some(Direction::In {
                        param,
                        nullable: slot == 1,
                    }),
                    slot @ 2..=5 => Some(Direction::InOut {
                        param,
                        constraint: ParamConstraint::from_ordinal(slot - 2)?,
                    }),
                    slot => Some(Direction::InThrow {
                        param,
                        constraint: ParamConstraint::from_ordinal(slot - 6)?,
                    }),
                }
            }
        }
    }

    /// The parameter this direction talks about, if any.
    pub fn param_index(self) -> Option<u16> {
        match self {
            Direction::In { param, .. }
            | Direction::InOut { param, .. }
            | Direction::InThrow { param, .. } => Some(param),
            _ => None,
        }
    }
}

/// Equation key: a member, a direction, a stability bit and a negation
/// bit. Unstable keys stand for virtual dispatch that subclasses may
/// override; negated keys stand for the boolean complement of the fact.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct EKey {
    pub member: MemberId,
    pub direction: Direction,
    pub stable: bool,
    pub negated: bool,
}

impl EKey {
    pub fn new(member: MemberId, direction: Direction, stable: bool) -> EKey {
        EKey {
            member,
            direction,
            stable,
            negated: false,
        }
    }

    pub fn invert_stability(&self) -> EKey {
        EKey {
            stable: !self.stable,
            ..self.clone()
        }
    }

    pub fn mk_stable(&self) -> EKey {
        EKey {
            stable: true,
            ..self.clone()
        }
    }

    pub fn mk_unstable(&self) -> EKey {
        EKey {
            stable: false,
            ..self.clone()
        }
    }

    pub fn negate(&self) -> EKey {
        EKey {
            negated: !self.negated,
            ..self.clone()
        }
    }

    /// The key all of a member's equations are filed under: `Out`,
    /// stable-agnostic, un-negated.
    pub fn mk_base(&self) -> EKey {
        EKey {
            member: self.member.clone(),
            direction: Direction::Out,
            stable: false,
            negated: false,
        }
    }

    pub fn with_direction(&self, direction: Direction) -> EKey {
        EKey {
            direction,
            ..self.clone()
        }
    }

    pub fn hashed(&self) -> EKey {
        EKey {
            member: MemberId::Hashed(self.member.hashed()),
            ..self.clone()
        }
    }
}
