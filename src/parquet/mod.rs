//! Handles serialising and saving analysis products in the _parquet_ file format.

pub mod field;

pub use field::save_field;
