pub mod error;
pub mod registry;

pub use error::{Result, SchemaError};
pub use registry::{
    Direction, ModelBuilder, ModelDef, PropagationSchema, RelationshipDef, SchemaBuilder,
    SchemaRegistry, SecondaryTable,
};
