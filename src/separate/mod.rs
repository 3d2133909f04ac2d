//! Send-side lazy splitters: produce parcels on demand from a single object
//! or file (spec.md §4.3, §4.4, GLOSSARY "Separator").

pub mod file;
pub mod object;
