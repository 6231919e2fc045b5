//! Derive macro for the `Trace` trait.
//!
//! Generates a `trace` body that hands every field to its own `Trace`
//! implementation, so pointer and value slots embedded in a heap payload are
//! reported to the collector's slot visitor in declaration order.
//!
//! Fields marked `#[segheap(skip)]` are not visited. The crate path can be
//! overridden with `#[segheap(crate = path::to::segheap)]` on the type.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Field, Fields,
    GenericParam, Generics, Ident, Index, Path,
};

#[proc_macro_derive(Trace, attributes(segheap))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut segheap: Path = parse_quote!(::segheap);

    for attr in &input.attrs {
        if !attr.path().is_ident("segheap") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                segheap = meta.value()?.parse()?;
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
    let generics = add_trait_bounds(&segheap, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = match generate_trace_body(&segheap, name, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #segheap::Trace for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&mut self, visitor: &mut dyn #segheap::SlotVisitor) {
                #trace_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(segheap: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });
            let has_static = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Lifetime(l) = b {
                    l.ident == "static"
                } else {
                    false
                }
            });

            if !has_trace {
                type_param.bounds.push(parse_quote!(#segheap::Trace));
            }
            if !has_static {
                type_param.bounds.push(parse_quote!('static));
            }
        }
    }
    generics
}

/// Returns `true` when the field carries `#[segheap(skip)]`.
fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident("segheap") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute, expected `skip`"))
            }
        })?;
    }
    Ok(skip)
}

fn traced_fields<'a>(
    fields: impl Iterator<Item = &'a Field>,
) -> syn::Result<Vec<(usize, &'a Field)>> {
    let mut out = Vec::new();
    for (i, field) in fields.enumerate() {
        if !is_skipped(&field.attrs)? {
            out.push((i, field));
        }
    }
    Ok(out)
}

fn generate_trace_body(segheap: &Path, name: &Ident, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => generate_struct_trace(segheap, &data.fields),
        Data::Enum(data) => generate_enum_trace(segheap, name, data),
        Data::Union(u) => Ok(quote_spanned! {
            u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
        }),
    }
}

fn generate_struct_trace(segheap: &Path, fields: &Fields) -> syn::Result<TokenStream> {
    match fields {
        Fields::Named(f) => {
            let trace_calls = traced_fields(f.named.iter())?.into_iter().map(|(_, field)| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #segheap::Trace::trace(&mut self.#name, visitor);
                }
            });
            Ok(quote! { #(#trace_calls)* })
        }
        Fields::Unnamed(f) => {
            let trace_calls = traced_fields(f.unnamed.iter())?.into_iter().map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #segheap::Trace::trace(&mut self.#index, visitor);
                }
            });
            Ok(quote! { #(#trace_calls)* })
        }
        Fields::Unit => Ok(quote! {}),
    }
}

fn generate_enum_trace(segheap: &Path, name: &Ident, data: &syn::DataEnum) -> syn::Result<TokenStream> {
    let mut match_arms = Vec::with_capacity(data.variants.len());
    for variant in &data.variants {
        let var_name = &variant.ident;
        let arm = match &variant.fields {
            Fields::Named(f) => {
                let traced = traced_fields(f.named.iter())?;
                let bindings: Vec<_> = traced.iter().map(|(i, _)| format_ident!("field{}", i)).collect();
                let idents: Vec<_> = traced.iter().map(|(_, f)| f.ident.as_ref()).collect();
                quote! {
                    #name::#var_name { #(#idents: #bindings,)* .. } => {
                        #(#segheap::Trace::trace(#bindings, visitor);)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let traced = traced_fields(f.unnamed.iter())?;
                let patterns = (0..f.unnamed.len()).map(|i| {
                    if traced.iter().any(|(t, _)| *t == i) {
                        let binding = format_ident!("field{}", i);
                        quote! { #binding }
                    } else {
                        quote! { _ }
                    }
                });
                let bindings = traced.iter().map(|(i, _)| format_ident!("field{}", i));
                quote! {
                    #name::#var_name(#(#patterns),*) => {
                        #(#segheap::Trace::trace(#bindings, visitor);)*
                    }
                }
            }
            Fields::Unit => quote! {
                #name::#var_name => {}
            },
        };
        match_arms.push(arm);
    }

    Ok(quote! {
        match self {
            #(#match_arms)*
        }
    })
}
