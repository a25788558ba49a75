//! Wire-level request / response types.

pub mod v1;
