//! Privilege checking.

mod privileges;

pub use privileges::Privileges;
