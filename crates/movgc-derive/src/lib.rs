//! Derive macro for the `Managed` trait.

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Index, Path, Type,
};

/// Derives `Managed` for a struct by describing every field at its
/// `offset_of!` position.
///
/// Attributes:
/// - `#[movgc(crate = path)]` names the `movgc` crate.
/// - `#[movgc(pinned)]` makes the type non-movable.
#[proc_macro_derive(Managed, attributes(movgc))]
pub fn derive_managed(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut movgc: Path = parse_quote!(::movgc);
    let mut pinned = false;

    for attr in &input.attrs {
        if !attr.path().is_ident("movgc") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                movgc = meta.value()?.parse()?;
                Ok(())
            } else if meta.path.is_ident("pinned") {
                pinned = true;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&movgc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let self_ty = quote! { #name #ty_generics };

    let fields = match &input.data {
        Data::Struct(data) => &data.fields,
        Data::Enum(data) => {
            return quote_spanned! {
                data.enum_token.span => compile_error!("`Managed` cannot be derived for enums; implement it by hand");
            }
            .into();
        }
        Data::Union(data) => {
            return quote_spanned! {
                data.union_token.span => compile_error!("`Managed` must be manually implemented for unions");
            }
            .into();
        }
    };

    let describe_body = generate_describe(&movgc, &self_ty, fields);
    let movable = generate_movable(&movgc, fields, pinned);

    let generated = quote! {
        unsafe impl #impl_generics #movgc::Managed for #name #ty_generics #where_clause {
            const MOVABLE: bool = #movable;

            #[inline]
            #[allow(unused_variables)]
            fn describe(layout: &mut #movgc::LayoutBuilder, base: usize) {
                #describe_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(movgc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_managed = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Managed")
                } else {
                    false
                }
            });
            if !has_managed {
                type_param.bounds.push(parse_quote!(#movgc::Managed));
            }
        }
    }
    generics
}

fn field_types(fields: &Fields) -> Vec<&Type> {
    match fields {
        Fields::Named(f) => f.named.iter().map(|field| &field.ty).collect(),
        Fields::Unnamed(f) => f.unnamed.iter().map(|field| &field.ty).collect(),
        Fields::Unit => Vec::new(),
    }
}

fn generate_describe(movgc: &Path, self_ty: &TokenStream, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(f) => {
            let calls = f.named.iter().map(|field| {
                let name = &field.ident;
                let ty = &field.ty;
                quote_spanned! {field.span() =>
                    <#ty as #movgc::Managed>::describe(
                        layout,
                        base + ::core::mem::offset_of!(#self_ty, #name),
                    );
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unnamed(f) => {
            let calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                let index = Index::from(i);
                let ty = &field.ty;
                quote_spanned! {field.span() =>
                    <#ty as #movgc::Managed>::describe(
                        layout,
                        base + ::core::mem::offset_of!(#self_ty, #index),
                    );
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unit => quote! {},
    }
}

fn generate_movable(movgc: &Path, fields: &Fields, pinned: bool) -> TokenStream {
    if pinned {
        return quote! { false };
    }
    let types = field_types(fields);
    quote! { true #(&& <#types as #movgc::Managed>::MOVABLE)* }
}
