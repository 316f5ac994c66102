use heck::ToSnakeCase;
use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use syn::{spanned::Spanned, Data, DeriveInput, Error, Fields, Lit, LitInt, LitStr, Result};

use crate::types::{field_type_of, parse_kind};

/// Expands the `#[derive(Model)]` macro.
///
/// Generates an `impl keel_orm::Model` whose `schema()` builds the
/// `ModelSchema` on first use, plus `from_record` and `to_values`.
pub fn expand(ast: DeriveInput) -> Result<TokenStream> {
    let struct_name = &ast.ident;
    if !ast.generics.params.is_empty() {
        return Err(Error::new(ast.generics.span(), "Model cannot be derived for generic structs"));
    }

    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => return Err(Error::new(struct_name.span(), "Model must have named fields")),
        },
        _ => return Err(Error::new(struct_name.span(), "Model must be a struct")),
    };

    let model = parse_model_attrs(&ast)?;
    let model_name = struct_name.to_string();

    let table = model.table.map(|table| quote! { .table(#table) });

    let mut field_defs = Vec::new();
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    let mut columns = Vec::new();
    let mut primary_key: Option<&syn::Ident> = None;
    for field in fields {
        let ident = field.ident.as_ref().ok_or_else(|| Error::new(field.span(), "Model must have named fields"))?;
        let column = ident.to_string();

        let (definition, is_primary_key) = field_definition(field, &column)?;
        if is_primary_key && primary_key.replace(ident).is_some() {
            return Err(Error::new(ident.span(), "Model needs exactly one `#[orm(primary_key)]` field, found a second one"));
        }
        field_defs.push(definition);
        reads.push(quote! { #ident: record.try_get(#column)? });
        writes.push(quote! { (#column, ::keel_orm::Value::from(::core::clone::Clone::clone(&self.#ident))) });
        columns.push(column);
    }
    if primary_key.is_none() {
        return Err(Error::new(struct_name.span(), "Model needs exactly one `#[orm(primary_key)]` field"));
    }

    let mut relationships = Vec::new();
    let mut relationship_names = Vec::new();
    for rel in &model.relationships {
        let (name, tokens) = rel.to_tokens(&model_name, &columns)?;
        if relationship_names.contains(&name) {
            return Err(Error::new(rel.span, format!("relationship `{name}` is declared twice")));
        }
        relationships.push(quote! { (#name, #tokens) });
        relationship_names.push(name);
    }

    Ok(quote! {
        impl ::keel_orm::Model for #struct_name {
            fn schema() -> ::std::sync::Arc<::keel_orm::ModelSchema> {
                static SCHEMA: ::std::sync::OnceLock<::std::sync::Arc<::keel_orm::ModelSchema>> =
                    ::std::sync::OnceLock::new();
                ::std::sync::Arc::clone(SCHEMA.get_or_init(|| {
                    ::keel_orm::ModelSchema::builder(#model_name)
                        #table
                        #(.field(#field_defs))*
                        #(.relationship #relationships)*
                        .build()
                        .unwrap_or_else(|err| panic!("invalid model {}: {}", #model_name, err))
                }))
            }

            fn from_record(record: &::keel_orm::Record) -> ::keel_orm::Result<Self> {
                ::core::result::Result::Ok(Self { #(#reads),* })
            }

            fn to_values(&self) -> ::keel_orm::Result<::std::vec::Vec<(&'static str, ::keel_orm::Value)>> {
                ::core::result::Result::Ok(::std::vec![#(#writes),*])
            }
        }
    })
}

// ============================================================================
// Field attributes
// ============================================================================

/// Builder tokens for one column, and whether it is the primary key.
fn field_definition(field: &syn::Field, column: &str) -> Result<(TokenStream, bool)> {
    let (inferred, nullable) = field_type_of(&field.ty);

    let mut primary_key = false;
    let mut auto_increment = false;
    let mut unique = false;
    let mut index = false;
    let mut size: Option<usize> = None;
    let mut default: Option<Lit> = None;
    let mut default_now = false;
    let mut kind: Option<&'static str> = None;
    let mut description: Option<String> = None;

    for attr in field.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("primary_key") {
                primary_key = true;
            } else if meta.path.is_ident("auto_increment") {
                auto_increment = true;
            } else if meta.path.is_ident("unique") {
                unique = true;
            } else if meta.path.is_ident("index") {
                index = true;
            } else if meta.path.is_ident("size") {
                let value: LitInt = meta.value()?.parse()?;
                size = Some(value.base10_parse()?);
            } else if meta.path.is_ident("default") {
                default = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("default_now") {
                default_now = true;
            } else if meta.path.is_ident("kind") {
                let value: LitStr = meta.value()?.parse()?;
                kind = Some(parse_kind(&value.value()).ok_or_else(|| Error::new(value.span(), "unknown field kind"))?);
            } else if meta.path.is_ident("description") {
                let value: LitStr = meta.value()?.parse()?;
                description = Some(value.value());
            } else {
                return Err(meta.error("unknown orm field attribute"));
            }
            Ok(())
        })?;
    }

    let mut variant = kind
        .or(inferred)
        .ok_or_else(|| Error::new(field.ty.span(), "cannot map this type to a column; add #[orm(kind = \"…\")]"))?;
    if size.is_some() {
        match variant {
            "Text" if kind.is_none() => variant = "Varchar",
            "Varchar" | "Text" => {}
            _ => return Err(Error::new(field.span(), "`size` only applies to text columns")),
        }
    }

    let variant_ident = format_ident!("{}", variant);
    let mut tokens = quote! { ::keel_orm::Field::new(#column, ::keel_orm::FieldType::#variant_ident) };

    if primary_key {
        tokens.extend(quote! { .primary_key() });
    } else if !nullable {
        tokens.extend(quote! { .not_null() });
    }
    if auto_increment {
        if !matches!(variant, "SmallInt" | "Int" | "BigInt") {
            return Err(Error::new(field.span(), "`auto_increment` needs an integer column"));
        }
        tokens.extend(quote! { .auto_increment() });
    }
    if unique {
        tokens.extend(quote! { .unique() });
    }
    if index {
        tokens.extend(quote! { .index() });
    }
    if let Some(size) = size {
        tokens.extend(quote! { .max_length(#size) });
    }
    match (default, default_now) {
        (Some(_), true) => return Err(Error::new(field.span(), "use either `default` or `default_now`")),
        (Some(lit), false) => tokens.extend(quote! { .default(#lit) }),
        (None, true) => {
            let generator = match variant {
                "Timestamp" => quote! { ::keel_orm::Value::now },
                "Date" => quote! { ::keel_orm::Value::today },
                _ => return Err(Error::new(field.span(), "`default_now` needs a timestamp or date column")),
            };
            tokens.extend(quote! { .default_with(#generator) });
        }
        (None, false) => {}
    }
    if let Some(description) = description {
        tokens.extend(quote! { .description(#description) });
    }

    Ok((tokens, primary_key))
}

// ============================================================================
// Model attributes
// ============================================================================

#[derive(Default)]
struct ModelAttrs {
    table: Option<String>,
    relationships: Vec<RelationAttr>,
}

#[derive(Clone, Copy, PartialEq)]
enum RelationKind {
    HasMany,
    HasOne,
    BelongsTo,
    ManyToMany,
}

struct RelationAttr {
    kind: RelationKind,
    span: Span,
    name: Option<String>,
    model: Option<String>,
    foreign_key: Option<String>,
    foreign_key_span: Option<Span>,
    through: Option<String>,
    related_name: Option<String>,
    source_column: Option<String>,
    target_column: Option<String>,
}

fn parse_model_attrs(ast: &DeriveInput) -> Result<ModelAttrs> {
    let mut attrs = ModelAttrs::default();

    for attr in ast.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.table = Some(value.value());
                return Ok(());
            }

            let kind = if meta.path.is_ident("has_many") {
                RelationKind::HasMany
            } else if meta.path.is_ident("has_one") {
                RelationKind::HasOne
            } else if meta.path.is_ident("belongs_to") {
                RelationKind::BelongsTo
            } else if meta.path.is_ident("many_to_many") {
                RelationKind::ManyToMany
            } else {
                return Err(meta.error("unknown orm model attribute"));
            };

            let mut rel = RelationAttr {
                kind,
                span: meta.path.span(),
                name: None,
                model: None,
                foreign_key: None,
                foreign_key_span: None,
                through: None,
                related_name: None,
                source_column: None,
                target_column: None,
            };
            meta.parse_nested_meta(|inner| {
                let lit = inner.value()?.parse::<LitStr>()?;
                let value = lit.value();
                let slot = if inner.path.is_ident("name") {
                    &mut rel.name
                } else if inner.path.is_ident("model") {
                    &mut rel.model
                } else if inner.path.is_ident("foreign_key") {
                    rel.foreign_key_span = Some(lit.span());
                    &mut rel.foreign_key
                } else if inner.path.is_ident("through") {
                    &mut rel.through
                } else if inner.path.is_ident("related_name") {
                    &mut rel.related_name
                } else if inner.path.is_ident("source_column") {
                    &mut rel.source_column
                } else if inner.path.is_ident("target_column") {
                    &mut rel.target_column
                } else {
                    return Err(inner.error("unknown relationship key"));
                };
                *slot = Some(value);
                Ok(())
            })?;
            attrs.relationships.push(rel);
            Ok(())
        })?;
    }

    Ok(attrs)
}

impl RelationAttr {
    /// The relationship name and its `Relationship::…` constructor.
    ///
    /// `columns` are the owner's own columns; a `belongs_to` key must be one of them.
    fn to_tokens(&self, owner: &str, columns: &[String]) -> Result<(String, TokenStream)> {
        let model = self.model.as_deref().ok_or_else(|| Error::new(self.span, "relationship needs `model = \"…\"`"))?;
        let model_snake = model.to_snake_case();

        let name = self.name.clone().unwrap_or_else(|| match self.kind {
            RelationKind::HasMany | RelationKind::ManyToMany => format!("{model_snake}s"),
            RelationKind::HasOne | RelationKind::BelongsTo => model_snake.clone(),
        });

        let mut tokens = match self.kind {
            RelationKind::ManyToMany => {
                let through = self
                    .through
                    .as_deref()
                    .ok_or_else(|| Error::new(self.span, "many_to_many needs `through = \"…\"`"))?;
                if model == owner && self.source_column.is_none() && self.target_column.is_none() {
                    return Err(Error::new(
                        self.span,
                        "a many_to_many onto its own model needs `source_column` and `target_column`",
                    ));
                }
                quote! { ::keel_orm::Relationship::many_to_many(#model, #through) }
            }
            RelationKind::BelongsTo => {
                let fk = self.foreign_key.clone().unwrap_or_else(|| format!("{model_snake}_id"));
                if !columns.contains(&fk) {
                    let span = self.foreign_key_span.unwrap_or(self.span);
                    return Err(Error::new(span, format!("belongs_to foreign key `{fk}` is not a field of {owner}")));
                }
                quote! { ::keel_orm::Relationship::many_to_one(#model, #fk) }
            }
            RelationKind::HasMany | RelationKind::HasOne => {
                let fk = self.foreign_key.clone().unwrap_or_else(|| format!("{}_id", owner.to_snake_case()));
                let constructor = if self.kind == RelationKind::HasMany {
                    quote! { one_to_many }
                } else {
                    quote! { one_to_one }
                };
                quote! { ::keel_orm::Relationship::#constructor(#model, #fk) }
            }
        };

        if let Some(related_name) = &self.related_name {
            tokens.extend(quote! { .related_name(#related_name) });
        }
        match (&self.source_column, &self.target_column) {
            (Some(source), Some(target)) => tokens.extend(quote! { .through_columns(#source, #target) }),
            (None, None) => {}
            _ => return Err(Error::new(self.span, "`source_column` and `target_column` go together")),
        }

        Ok((name, tokens))
    }
}
