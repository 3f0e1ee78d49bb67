//! Settings, see [`PolymorphicSettings`].

pub use polymorph_conf::*;
