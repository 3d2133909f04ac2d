//! Receive-side reassemblers: consume parcels in strict sequence for one
//! object or file (spec.md §4, GLOSSARY "Agglomerator").

pub mod file;
pub mod object;
