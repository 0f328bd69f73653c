use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Ident, LitStr};

/// Implements `sea_orm_tree::TreeEntity` for the `Entity` next to a SeaORM `Model`.
///
/// ```ignore
/// #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeEntity)]
/// #[sea_orm(table_name = "categories")]
/// #[tree(strategy = "nested", left = "lft", right = "rgt", level = "lvl")]
/// pub struct Model { /* ... */ }
/// ```
#[proc_macro_derive(TreeEntity, attributes(tree))]
pub fn derive_tree_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_tree_entity(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    strategy: Option<LitStr>,
    root_identifier: Option<Ident>,
    setters: Vec<TokenStream2>,
}

fn impl_tree_entity(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_ident = &input.ident;
    if !matches!(input.data, Data::Struct(_)) {
        return Err(syn::Error::new(
            input.span(),
            "TreeEntity can only be derived for SeaORM model structs",
        ));
    }

    let mut options = Options::default();
    let mut table_name: Option<String> = None;
    for attr in &input.attrs {
        if attr.path().is_ident("tree") {
            parse_tree_attr(attr, &mut options)?;
        }
        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let strategy_lit = options.strategy.ok_or_else(|| {
        syn::Error::new(
            struct_ident.span(),
            "missing `strategy` in #[tree(...)], expected \"nested\", \"closure\" or \"materialized_path\"",
        )
    })?;
    let strategy = match strategy_lit.value().as_str() {
        "nested" => format_ident!("Nested"),
        "closure" => format_ident!("Closure"),
        "materialized_path" | "materializedPath" => format_ident!("MaterializedPath"),
        other => {
            return Err(syn::Error::new(
                strategy_lit.span(),
                format!("unknown tree strategy `{other}`"),
            ))
        }
    };

    let table = table_name.unwrap_or_else(|| to_snake_case(&struct_ident.unraw().to_string()));
    let table_literal = LitStr::new(&table, struct_ident.span());
    let setters = &options.setters;

    let root_identifier = options.root_identifier.map(|method| {
        quote! {
            fn root_identifier(
                model: &<Self as ::sea_orm::EntityTrait>::Model,
            ) -> ::core::option::Option<::sea_orm_tree::Identifier> {
                #struct_ident::#method(model)
            }
        }
    });

    Ok(quote! {
        impl ::sea_orm_tree::TreeEntity for Entity {
            type NodeActiveModel = ActiveModel;

            fn tree_config() -> &'static ::sea_orm_tree::TreeConfig {
                static CONFIG: ::sea_orm_tree::__private::Lazy<::sea_orm_tree::TreeConfig> =
                    ::sea_orm_tree::__private::Lazy::new(|| {
                        let base = ::sea_orm_tree::TreeConfig::new(
                            ::sea_orm_tree::StrategyKind::#strategy,
                            #table_literal,
                        );
                        ::sea_orm_tree::TreeOptions::default()
                            #(#setters)*
                            .apply(base)
                    });
                &CONFIG
            }

            #root_identifier
        }
    })
}

fn parse_tree_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "invalid tree option key"))?
            .to_string();

        match ident.as_str() {
            "strategy" => {
                options.strategy = Some(meta.value()?.parse()?);
            }
            "root_identifier" => {
                let value: LitStr = meta.value()?.parse()?;
                options.root_identifier = Some(value.parse()?);
                options
                    .setters
                    .push(quote! { .root_identifier_method(true) });
            }
            "parent" | "left" | "right" | "root" | "level" | "path" | "path_source"
            | "path_hash" | "path_separator" | "closure_table" | "closure_ancestor"
            | "closure_descendant" | "closure_depth" => {
                let value: LitStr = meta.value()?.parse()?;
                let setter = format_ident!("{}", ident);
                options.setters.push(quote! { .#setter(#value) });
            }
            "level_base" => {
                let value: syn::LitInt = meta.value()?.parse()?;
                let value: i64 = value.base10_parse()?;
                options.setters.push(quote! { .level_base(#value) });
            }
            "path_append_id" | "path_starts_with_separator" | "path_ends_with_separator"
            | "activate_locking" => {
                let value = if meta.input.peek(syn::Token![=]) {
                    let value: syn::LitBool = meta.value()?.parse()?;
                    value.value
                } else {
                    true
                };
                let setter = format_ident!("{}", ident);
                options.setters.push(quote! { .#setter(#value) });
            }
            other => {
                return Err(syn::Error::new(
                    meta.path.span(),
                    format!("unsupported tree option `{other}`"),
                ));
            }
        }

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            let _: syn::Expr = meta.value()?.parse()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

fn to_snake_case(value: &str) -> String {
    let mut snake = String::with_capacity(value.len() + 4);
    for (index, ch) in value.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                snake.push('_');
            }
            snake.push(ch.to_ascii_lowercase());
        } else {
            snake.push(ch);
        }
    }
    snake
}
