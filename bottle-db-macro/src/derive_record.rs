//! # Record Derive Expansion
//!
//! Reads the struct and its `#[record(...)]` attributes and generates the
//! `bottle_db::Record` implementation.
//!
//! ```rust,ignore
//! // Input:
//! #[derive(Record)]
//! struct BlogPost {
//!     #[record(primary_key, auto_increment)]
//!     id: i64,
//!     #[record(size = 200)]
//!     title: String,
//! }
//!
//! // Generated:
//! impl bottle_db::Record for BlogPost {
//!     fn table_name() -> &'static str { "blog_post" }
//!     fn to_fields(&self) -> Vec<(String, bottle_db::Value)> { /* id, title */ }
//!     fn forge_fields() -> Vec<bottle_db::Field> { /* BIGINT auto, VARCHAR(200) */ }
//!     fn primary_keys() -> Vec<&'static str> { vec!["id"] }
//! }
//! ```

use heck::ToSnakeCase;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitInt, LitStr};

use crate::types::{apply_size, rust_type_to_column};

/// Parsed `#[record(...)]` options of one field.
#[derive(Default)]
struct FieldOptions {
    primary_key: bool,
    auto_increment: bool,
    unique: bool,
    skip: bool,
    size: Option<u32>,
    column: Option<String>,
}

fn table_name(ast: &DeriveInput) -> syn::Result<String> {
    let mut table = None;
    for attr in ast.attrs.iter().filter(|a| a.path().is_ident("record")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value: LitStr = meta.value()?.parse()?;
                table = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unknown struct attribute, expected `table = \"...\"`"))
            }
        })?;
    }
    Ok(table.unwrap_or_else(|| ast.ident.to_string().to_snake_case()))
}

fn field_options(field: &syn::Field) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("record")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("primary_key") {
                options.primary_key = true;
            } else if meta.path.is_ident("auto_increment") {
                options.auto_increment = true;
            } else if meta.path.is_ident("unique") {
                options.unique = true;
            } else if meta.path.is_ident("skip") {
                options.skip = true;
            } else if meta.path.is_ident("size") {
                let value: LitInt = meta.value()?.parse()?;
                options.size = Some(value.base10_parse()?);
            } else if meta.path.is_ident("column") {
                let value: LitStr = meta.value()?.parse()?;
                options.column = Some(value.value());
            } else {
                return Err(meta.error("unknown record attribute"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

pub fn expand(ast: DeriveInput) -> syn::Result<TokenStream> {
    let struct_name = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let Data::Struct(data) = &ast.data else {
        return Err(syn::Error::new_spanned(struct_name, "Record can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(struct_name, "Record needs named fields"));
    };

    let table = table_name(&ast)?;

    let mut pairs = Vec::new();
    let mut definitions = Vec::new();
    let mut primary_keys = Vec::new();

    for field in &fields.named {
        let options = field_options(field)?;
        if options.skip {
            continue;
        }
        let Some(ident) = &field.ident else {
            continue;
        };

        let column = options.column.clone().unwrap_or_else(|| ident.to_string().trim_start_matches("r#").to_string());

        pairs.push(quote! {
            (#column.to_string(), bottle_db::Value::from(::std::clone::Clone::clone(&self.#ident)))
        });

        let mut column_type = rust_type_to_column(&field.ty);
        if let Some(size) = options.size {
            apply_size(&mut column_type, size);
        }

        let sql_type = column_type.sql_type;
        let mut definition = quote! { bottle_db::Field::new(#column, #sql_type) };
        if let Some(length) = column_type.length {
            definition = quote! { #definition.constraint(#length) };
        }
        if column_type.unsigned {
            definition = quote! { #definition.unsigned() };
        }
        if column_type.nullable {
            definition = quote! { #definition.null(true) };
        }
        if options.auto_increment {
            definition = quote! { #definition.auto_increment() };
        }
        if options.unique {
            definition = quote! { #definition.unique() };
        }
        definitions.push(definition);

        if options.primary_key {
            primary_keys.push(column);
        }
    }

    Ok(quote! {
        impl #impl_generics bottle_db::Record for #struct_name #ty_generics #where_clause {
            fn table_name() -> &'static str {
                #table
            }

            fn to_fields(&self) -> Vec<(String, bottle_db::Value)> {
                vec![#(#pairs),*]
            }

            fn forge_fields() -> Vec<bottle_db::Field> {
                vec![#(#definitions),*]
            }

            fn primary_keys() -> Vec<&'static str> {
                vec![#(#primary_keys),*]
            }
        }
    })
}
