//! Privilege bitmask.
//!
//! An immutable 11-bit value object. Every operation is total: there is
//! no invalid bit pattern for `Privileges` itself, though `format_priv`
//! rejects masks that aren't exactly one bit.

use crate::{Result, StorageError};

const BIT_COUNT: u32 = 11;

macro_rules! priv_bits {
    ($($name:ident = $bit:expr => $label:expr),+ $(,)?) => {
        impl Privileges {
            $(pub const $name: Privileges = Privileges(1 << $bit);)+
        }

        fn priv_name(bit: u32) -> Option<&'static str> {
            match bit {
                $($bit => Some($label),)+
                _ => None,
            }
        }

        fn priv_bit(name: &str) -> Option<u32> {
            match name {
                $($label => Some($bit),)+
                _ => None,
            }
        }
    };
}

/// An 11-bit privilege mask. Construct via the `Privileges::SELECT` etc.
/// constants, `Privileges::merge`, or `Privileges::parse_string`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Privileges(u16);

priv_bits! {
    SELECT     = 0  => "SELECT",
    DELETE     = 1  => "DELETE",
    UPDATE     = 2  => "UPDATE",
    INSERT     = 3  => "INSERT",
    REFERENCES = 4  => "REFERENCES",
    USAGE      = 5  => "USAGE",
    COMPACT    = 6  => "COMPACT",
    CREATE     = 7  => "CREATE",
    ALTER      = 8  => "ALTER",
    DROP       = 9  => "DROP",
    LIST       = 10 => "LIST",
}

impl Privileges {
    pub const NONE: Privileges = Privileges(0);
    pub const ALL: Privileges = Privileges((1 << BIT_COUNT) - 1);

    /// Predefined bundles.
    pub const TABLE_ALL: Privileges = Privileges::ALL;
    pub const TABLE_READ: Privileges = Privileges(Self::SELECT.0);
    pub const SCHEMA_ALL: Privileges = Privileges::ALL;
    pub const SCHEMA_READ: Privileges = Privileges(Self::SELECT.0 | Self::LIST.0);
    pub const PROCEDURE_ALL: Privileges = Privileges::ALL;
    pub const PROCEDURE_EXECUTE: Privileges = Privileges(Self::USAGE.0);

    pub fn to_int(self) -> u16 {
        self.0
    }

    pub fn from_int(mask: u16) -> Self {
        Privileges(mask & Self::ALL.0)
    }

    pub fn add(self, other: Privileges) -> Privileges {
        Privileges(self.0 | other.0)
    }

    pub fn remove(self, other: Privileges) -> Privileges {
        Privileges(self.0 & !other.0)
    }

    pub fn merge(self, other: Privileges) -> Privileges {
        self.add(other)
    }

    pub fn permits(self, required: Privileges) -> bool {
        self.0 & required.0 == required.0
    }

    /// Parses a single privilege name (e.g. `"INSERT"`). Case-sensitive,
    /// matching the SQL-spelled names `format_priv` emits.
    pub fn parse_string(name: &str) -> Result<Privileges> {
        priv_bit(name)
            .map(|bit| Privileges(1 << bit))
            .ok_or_else(|| StorageError::Schema(format!("unknown privilege: {name}")))
    }

    /// Returns the SQL-spelled name for a mask that has exactly one bit
    /// set. Zero or multi-bit masks are a usage error.
    pub fn format_priv(self) -> Result<&'static str> {
        if self.0 == 0 || self.0.count_ones() != 1 {
            return Err(StorageError::Usage(format!(
                "format_priv requires exactly one bit set, got {:#x}",
                self.0
            )));
        }
        let bit = self.0.trailing_zeros();
        priv_name(bit).ok_or_else(|| StorageError::Usage(format!("no name for bit {bit}")))
    }

    /// `||SELECT||DELETE||...||` encoding used by the catalog's
    /// persisted grant records.
    pub fn to_encoded_string(self) -> String {
        let names: Vec<&str> = (0..BIT_COUNT)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| priv_name(bit).expect("every declared bit has a name"))
            .collect();
        if names.is_empty() {
            "||".to_string()
        } else {
            format!("||{}||", names.join("||"))
        }
    }
}

impl Default for Privileges {
    fn default() -> Self {
        Privileges::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_permits_is_true() {
        let p = Privileges::NONE.add(Privileges::INSERT);
        assert!(p.permits(Privileges::INSERT));
    }

    #[test]
    fn remove_is_identity_on_absent_priv() {
        let p = Privileges::SELECT;
        assert_eq!(p.remove(Privileges::INSERT), p);
    }

    #[test]
    fn to_int_from_int_roundtrip() {
        let p = Privileges::SELECT.add(Privileges::DROP).add(Privileges::ALTER);
        assert_eq!(Privileges::from_int(p.to_int()), p);
    }

    #[test]
    fn from_int_masks_out_of_range_bits() {
        let p = Privileges::from_int(0xFFFF);
        assert_eq!(p, Privileges::ALL);
    }

    #[test]
    fn parse_string_round_trips_with_format_priv() {
        assert_eq!(Privileges::parse_string("INSERT").unwrap(), Privileges::INSERT);
        assert_eq!(Privileges::INSERT.format_priv().unwrap(), "INSERT");
    }

    #[test]
    fn parse_string_rejects_unknown_name() {
        assert!(Privileges::parse_string("FROBNICATE").is_err());
    }

    #[test]
    fn format_priv_rejects_zero_and_multi_bit() {
        assert!(Privileges::NONE.format_priv().is_err());
        assert!(Privileges::SELECT.add(Privileges::INSERT).format_priv().is_err());
    }

    #[test]
    fn encoded_string_for_all_matches_spec_example() {
        assert_eq!(
            Privileges::ALL.to_encoded_string(),
            "||SELECT||DELETE||UPDATE||INSERT||REFERENCES||USAGE||COMPACT||CREATE||ALTER||DROP||LIST||"
        );
    }

    #[test]
    fn table_read_is_select_only() {
        assert_eq!(Privileges::TABLE_READ, Privileges::SELECT);
    }
}
