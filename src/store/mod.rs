pub mod crud;
pub mod entity;
pub mod staged;

pub use crud::Crud;
pub use entity::{EntityRow, FieldValue};
pub use staged::{Provenance, StagedRow, Store, StoreError};
