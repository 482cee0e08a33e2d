//! ID space arithmetic.
//!
//! Identifiers are 32-bit unsigned integers interpreted through an
//! [`IdSpace`] tag that says which bytes are significant and how the
//! terminal recovers the id from a placeholder cell (foreground colour plus
//! an optional third combining mark carrying the fourth byte).

use crate::utils::{IkupError, Result};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdSpace {
    Bits8,
    Bits8Diacritic,
    Bits16,
    Bits24,
    Bits32,
}

impl IdSpace {
    pub const ALL: [IdSpace; 5] = [
        IdSpace::Bits8,
        IdSpace::Bits8Diacritic,
        IdSpace::Bits16,
        IdSpace::Bits24,
        IdSpace::Bits32,
    ];

    /// Canonical name, also used in database file names.
    pub fn name(&self) -> &'static str {
        match self {
            IdSpace::Bits8 => "8bit",
            IdSpace::Bits8Diacritic => "8bit_diacritic",
            IdSpace::Bits16 => "16bit",
            IdSpace::Bits24 => "24bit",
            IdSpace::Bits32 => "32bit",
        }
    }

    /// Bit position of the space's most significant byte, the one a
    /// subspace constrains.
    pub fn high_byte_shift(&self) -> u32 {
        match self {
            IdSpace::Bits8 => 0,
            IdSpace::Bits16 => 8,
            IdSpace::Bits24 => 16,
            IdSpace::Bits8Diacritic | IdSpace::Bits32 => 24,
        }
    }

    pub fn high_byte(&self, id: u32) -> u8 {
        ((id >> self.high_byte_shift()) & 0xFF) as u8
    }

    /// Infer the space an id belongs to. The five spaces are disjoint:
    /// ids with a non-zero fourth byte belong to the diacritic-bearing
    /// spaces, the rest are classified by value width.
    pub fn from_id(id: u32) -> Result<IdSpace> {
        if id == 0 {
            return Err(IkupError::invalid_arg("id 0 is reserved"));
        }
        if id & 0xFF00_0000 != 0 {
            if id & 0x00FF_FFFF == 0 {
                Ok(IdSpace::Bits8Diacritic)
            } else {
                Ok(IdSpace::Bits32)
            }
        } else if id <= 0xFF {
            Ok(IdSpace::Bits8)
        } else if id <= 0xFFFF {
            Ok(IdSpace::Bits16)
        } else {
            Ok(IdSpace::Bits24)
        }
    }

    /// True iff `id` is a valid member of this space.
    pub fn contains(&self, id: u32) -> bool {
        IdSpace::from_id(id).map(|s| s == *self).unwrap_or(false)
    }

    /// Produce a uniformly random identifier with the high byte constrained
    /// to `subspace`. The significant bytes are kept non-zero as required
    /// by the space so the id stays recognisable and never collides with
    /// the reserved id 0.
    pub fn random_id(&self, subspace: IdSubspace, rng: &mut impl Rng) -> u32 {
        let high = subspace.random_nonzero_byte(rng) as u32;
        match self {
            IdSpace::Bits8 => high,
            IdSpace::Bits8Diacritic => high << 24,
            IdSpace::Bits16 => {
                let low: u32 = rng.gen_range(1..=255);
                (high << 8) | low
            }
            IdSpace::Bits24 => {
                // The high byte is already non-zero, the low 16 bits are free.
                let low: u32 = rng.gen_range(0..=0xFFFF);
                (high << 16) | low
            }
            IdSpace::Bits32 => {
                let low: u32 = rng.gen_range(0..=0xFF_FFFF);
                (high << 24) | low
            }
        }
    }

    /// Deterministic colour (and optional fourth-byte diacritic) a
    /// placeholder cell uses to encode `id`.
    pub fn cell_colour(&self, id: u32) -> (CellColour, Option<u8>) {
        let byte0 = (id & 0xFF) as u8;
        let byte1 = ((id >> 8) & 0xFF) as u8;
        let byte2 = ((id >> 16) & 0xFF) as u8;
        let byte3 = ((id >> 24) & 0xFF) as u8;
        match self {
            IdSpace::Bits8 => (CellColour::Indexed(byte0), None),
            IdSpace::Bits8Diacritic => (CellColour::Indexed(0), Some(byte3)),
            IdSpace::Bits16 => (CellColour::Indexed(byte1), Some(byte3)),
            IdSpace::Bits24 => (CellColour::Rgb(byte2, byte1, byte0), None),
            IdSpace::Bits32 => (CellColour::Rgb(byte2, byte1, byte0), Some(byte3)),
        }
    }
}

impl fmt::Display for IdSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IdSpace {
    type Err = IkupError;

    fn from_str(s: &str) -> Result<IdSpace> {
        match s.trim() {
            "8bit" | "8" => Ok(IdSpace::Bits8),
            "8bit_diacritic" | "diacritic" => Ok(IdSpace::Bits8Diacritic),
            "16bit" | "16" => Ok(IdSpace::Bits16),
            "24bit" | "24" => Ok(IdSpace::Bits24),
            "32bit" | "32" => Ok(IdSpace::Bits32),
            other => Err(IkupError::invalid_arg(format!(
                "invalid id space '{}', expected one of 8bit, 8bit_diacritic, 16bit, 24bit, 32bit",
                other
            ))),
        }
    }
}

/// Colour mode of a placeholder cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellColour {
    /// 256-colour palette index.
    Indexed(u8),
    /// Direct colour, (r, g, b).
    Rgb(u8, u8, u8),
}

/// Half-open range `[begin, end)` restricting the high byte of assigned
/// identifiers. Used to partition ids across cooperating producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSubspace {
    pub begin: u16,
    pub end: u16,
}

impl Default for IdSubspace {
    fn default() -> Self {
        Self { begin: 0, end: 256 }
    }
}

impl IdSubspace {
    pub fn new(begin: u16, end: u16) -> Result<IdSubspace> {
        if begin >= end || end > 256 {
            return Err(IkupError::invalid_arg(format!(
                "invalid id subspace {}:{}, need 0 <= begin < end <= 256",
                begin, end
            )));
        }
        // A subspace of just the zero byte has no assignable ids.
        if begin == 0 && end == 1 {
            return Err(IkupError::invalid_arg(
                "invalid id subspace 0:1, it contains no non-zero ids",
            ));
        }
        Ok(IdSubspace { begin, end })
    }

    pub fn is_full(&self) -> bool {
        self.begin == 0 && self.end == 256
    }

    pub fn contains(&self, byte: u8) -> bool {
        (byte as u16) >= self.begin && (byte as u16) < self.end
    }

    /// Number of bytes in the range.
    pub fn len(&self) -> u16 {
        self.end - self.begin
    }

    /// Uniformly random non-zero byte from the range.
    pub fn random_nonzero_byte(&self, rng: &mut impl Rng) -> u8 {
        loop {
            let b = rng.gen_range(self.begin..self.end) as u8;
            if b != 0 {
                return b;
            }
        }
    }
}

impl fmt::Display for IdSubspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.begin, self.end)
    }
}

impl FromStr for IdSubspace {
    type Err = IkupError;

    fn from_str(s: &str) -> Result<IdSubspace> {
        let (begin, end) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| IkupError::invalid_arg(format!("invalid id subspace '{}'", s)))?;
        let begin: u16 = begin
            .trim()
            .parse()
            .map_err(|_| IkupError::invalid_arg(format!("invalid id subspace '{}'", s)))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| IkupError::invalid_arg(format!("invalid id subspace '{}'", s)))?;
        IdSubspace::new(begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_subspace_parsing() {
        assert_eq!(
            "42:43".parse::<IdSubspace>().unwrap(),
            IdSubspace { begin: 42, end: 43 }
        );
        assert_eq!("0:256".parse::<IdSubspace>().unwrap(), IdSubspace::default());
        assert!("abc".parse::<IdSubspace>().is_err());
        assert!("a:b".parse::<IdSubspace>().is_err());
        assert!("0:1".parse::<IdSubspace>().is_err());
        assert!("0:1024".parse::<IdSubspace>().is_err());
        assert!("5:5".parse::<IdSubspace>().is_err());
        assert!("6:5".parse::<IdSubspace>().is_err());
    }

    #[test]
    fn test_space_parsing() {
        assert_eq!("24bit".parse::<IdSpace>().unwrap(), IdSpace::Bits24);
        assert_eq!("32".parse::<IdSpace>().unwrap(), IdSpace::Bits32);
        assert!("7bit".parse::<IdSpace>().is_err());
    }

    #[test]
    fn test_from_id_is_disjoint() {
        assert_eq!(IdSpace::from_id(0x2A).unwrap(), IdSpace::Bits8);
        assert_eq!(IdSpace::from_id(0x2A01).unwrap(), IdSpace::Bits16);
        assert_eq!(IdSpace::from_id(0x0012_3456).unwrap(), IdSpace::Bits24);
        assert_eq!(
            IdSpace::from_id(0x2A00_0000).unwrap(),
            IdSpace::Bits8Diacritic
        );
        assert_eq!(IdSpace::from_id(0x2A00_0001).unwrap(), IdSpace::Bits32);
        assert!(IdSpace::from_id(0).is_err());
    }

    #[test]
    fn test_random_id_respects_subspace() {
        let subspace = IdSubspace { begin: 42, end: 43 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for space in IdSpace::ALL {
            for _ in 0..50 {
                let id = space.random_id(subspace, &mut rng);
                assert_eq!(space.high_byte(id), 0x2A, "space {}", space);
                assert!(space.contains(id), "space {} id {:#x}", space, id);
            }
        }
        // In the 8-bit space a one-byte subspace pins the id itself.
        assert_eq!(IdSpace::Bits8.random_id(subspace, &mut rng), 42);
    }

    #[test]
    fn test_random_id_nonzero_bytes() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let id = IdSpace::Bits16.random_id(IdSubspace::default(), &mut rng);
            assert_ne!(id & 0xFF, 0);
            assert_ne!(id & 0xFF00, 0);
            assert_eq!(id & 0xFFFF_0000, 0);
        }
    }

    #[test]
    fn test_cell_colour() {
        assert_eq!(
            IdSpace::Bits24.cell_colour(0x0012_3456),
            (CellColour::Rgb(0x12, 0x34, 0x56), None)
        );
        assert_eq!(
            IdSpace::Bits8.cell_colour(0x2A),
            (CellColour::Indexed(0x2A), None)
        );
        assert_eq!(
            IdSpace::Bits8Diacritic.cell_colour(0x2A00_0000),
            (CellColour::Indexed(0), Some(0x2A))
        );
        assert_eq!(
            IdSpace::Bits16.cell_colour(0x2A17),
            (CellColour::Indexed(0x2A), Some(0))
        );
        assert_eq!(
            IdSpace::Bits32.cell_colour(0xAB12_3456),
            (CellColour::Rgb(0x12, 0x34, 0x56), Some(0xAB))
        );
    }
}
