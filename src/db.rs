//! Database layer: ORM, content types, polymorphic models, migrations.

pub use polymorph_db::*;
