//! Wire-level framing: the atomic parcel unit (spec.md §4.1).

pub mod parcel;
