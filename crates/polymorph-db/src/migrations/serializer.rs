//! Rendering of on-delete handlers as Rust expressions

use super::{MigrationError, Result};
use crate::orm::{HandlerRef, OnDelete, OnDeleteHandler, SetValue, Value};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use proc_macro2::TokenStream;
use quote::quote;
use std::any::TypeId;
use std::collections::HashMap;

/// Renders one handler type
pub type HandlerSerializer = fn(&dyn OnDeleteHandler) -> Result<TokenStream>;

static SERIALIZERS: Lazy<RwLock<HashMap<TypeId, HandlerSerializer>>> =
	Lazy::new(|| RwLock::new(HashMap::new()));

/// Register the serializer used for handlers of type `H`.
pub fn register_serializer<H: OnDeleteHandler>(serializer: HandlerSerializer) {
	SERIALIZERS.write().insert(TypeId::of::<H>(), serializer);
}

/// Remove the serializer registered for `H`.
pub fn unregister_serializer<H: OnDeleteHandler>() -> bool {
	SERIALIZERS.write().remove(&TypeId::of::<H>()).is_some()
}

/// Expression that rebuilds `handler` in a migration file.
///
/// A serializer registered for the handler's concrete type wins. Otherwise
/// the handler's [`HandlerRef`] decides: standard actions become `OnDelete`
/// constructors and custom references become a path to the handler value.
pub fn serialize_handler(handler: &dyn OnDeleteHandler) -> Result<TokenStream> {
	let registered = SERIALIZERS.read().get(&handler.as_any().type_id()).copied();
	if let Some(serializer) = registered {
		return serializer(handler);
	}
	match handler.reference() {
		HandlerRef::Action(action) => serialize_action(&action),
		HandlerRef::Custom(path) => {
			let path: syn::Path = syn::parse_str(&path)
				.map_err(|_| MigrationError::Unserializable(format!("{:?}", handler)))?;
			Ok(quote!(#path))
		}
	}
}

fn serialize_action(action: &OnDelete) -> Result<TokenStream> {
	Ok(match action {
		OnDelete::Cascade => quote!(OnDelete::Cascade),
		OnDelete::Protect => quote!(OnDelete::Protect),
		OnDelete::SetNull => quote!(OnDelete::SetNull),
		OnDelete::SetDefault => quote!(OnDelete::SetDefault),
		OnDelete::Restrict => quote!(OnDelete::Restrict),
		OnDelete::DoNothing => quote!(OnDelete::DoNothing),
		OnDelete::Set(SetValue::Value(value)) => {
			let value = value_tokens(value);
			quote!(OnDelete::set(#value))
		}
		OnDelete::Set(SetValue::Callable { path, .. }) => {
			let func: syn::Path =
				syn::parse_str(path).map_err(|_| MigrationError::Unserializable(path.clone()))?;
			quote!(OnDelete::set_with(#path, #func))
		}
	})
}

/// Literal expression for a value
pub(crate) fn value_tokens(value: &Value) -> TokenStream {
	match value {
		Value::Null => quote!(Value::Null),
		Value::Bool(b) => quote!(#b),
		Value::Int(i) => quote!(#i),
		Value::Float(f) if f.is_nan() => quote!(f64::NAN),
		Value::Float(f) if f.is_infinite() && *f > 0.0 => quote!(f64::INFINITY),
		Value::Float(f) if f.is_infinite() => quote!(f64::NEG_INFINITY),
		Value::Float(f) => quote!(#f),
		Value::Text(s) => quote!(#s),
	}
}
