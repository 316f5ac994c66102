use syn::{GenericArgument, PathArguments, Type};

/// Maps a Rust field type to a `FieldType` variant name.
///
/// Returns the variant (`None` for types with no natural column type) and
/// whether the field is nullable (`Option<T>`).
pub fn field_type_of(ty: &Type) -> (Option<&'static str>, bool) {
    let Type::Path(type_path) = ty else { return (None, false) };
    let Some(segment) = type_path.path.segments.last() else { return (None, false) };

    if segment.ident == "Option" {
        if let PathArguments::AngleBracketed(args) = &segment.arguments {
            if let Some(GenericArgument::Type(inner)) = args.args.first() {
                return (field_type_of(inner).0, true);
            }
        }
        return (None, true);
    }

    let variant = match segment.ident.to_string().as_str() {
        "i16" => "SmallInt",
        "i32" => "Int",
        "i64" => "BigInt",
        "f32" | "f64" => "Double",
        "bool" => "Boolean",
        "String" => "Text",
        "NaiveDateTime" | "DateTime" => "Timestamp",
        "NaiveDate" => "Date",
        "Decimal" => "Decimal",
        "Uuid" => "Uuid",
        "Value" | "JsonValue" => "Json",
        _ => return (None, false),
    };
    (Some(variant), false)
}

/// Parses the value of a `kind = "…"` attribute.
pub fn parse_kind(name: &str) -> Option<&'static str> {
    let variant = match name.to_ascii_lowercase().as_str() {
        "smallint" | "int2" => "SmallInt",
        "int" | "integer" | "int4" => "Int",
        "bigint" | "int8" => "BigInt",
        "varchar" => "Varchar",
        "text" => "Text",
        "bool" | "boolean" => "Boolean",
        "timestamp" => "Timestamp",
        "date" => "Date",
        "decimal" | "numeric" => "Decimal",
        "double" | "float" | "float8" => "Double",
        "json" => "Json",
        "uuid" => "Uuid",
        _ => return None,
    };
    Some(variant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_nullable() {
        let ty: Type = syn::parse_quote!(Option<chrono::NaiveDateTime>);
        assert_eq!(field_type_of(&ty), (Some("Timestamp"), true));

        let ty: Type = syn::parse_quote!(rust_decimal::Decimal);
        assert_eq!(field_type_of(&ty), (Some("Decimal"), false));

        let ty: Type = syn::parse_quote!(Vec<u8>);
        assert_eq!(field_type_of(&ty), (None, false));
    }

    #[test]
    fn kinds_are_case_insensitive() {
        assert_eq!(parse_kind("VarChar"), Some("Varchar"));
        assert_eq!(parse_kind("money"), None);
    }
}
