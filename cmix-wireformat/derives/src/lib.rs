use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{
    parse_macro_input, Data, DataEnum, DataStruct, DeriveInput, Field, Fields, Generics, Ident,
    Index, Type,
};

#[proc_macro_derive(ToBytes)]
pub fn derive_tobytes(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match input.data {
        Data::Struct(s) => derive_tobytes_struct(input.ident, input.generics, s),
        Data::Enum(e) => derive_tobytes_enum(input.ident, input.generics, e),
        Data::Union(_) => panic!("Derive not supported for union types"),
    }
}

#[proc_macro_derive(FromBytes)]
pub fn derive_frombytes(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match input.data {
        Data::Struct(s) => derive_frombytes_struct(input.ident, s),
        Data::Enum(e) => derive_frombytes_enum(input.ident, e),
        Data::Union(_) => panic!("Derive not supported for union types"),
    }
}

fn field_name_type_iter(fields: impl Iterator<Item = Field>) -> (Vec<TokenStream2>, Vec<Type>) {
    fields
        .enumerate()
        .map(|(idx, v)| {
            (
                v.ident
                    .map(|i| i.to_token_stream())
                    .unwrap_or(Index::from(idx).to_token_stream()),
                v.ty,
            )
        })
        .unzip::<_, _, Vec<_>, Vec<_>>()
}

/// Names used to bind the fields of an enum variant when matching on it
fn binding_names(fields: &Fields) -> Vec<Ident> {
    fields
        .iter()
        .enumerate()
        .map(|(idx, f)| match &f.ident {
            Some(ident) => ident.clone(),
            None => format_ident!("__field{}", idx),
        })
        .collect()
}

/// Pattern or constructor for a variant given the names its fields are bound to
fn variant_shape(path: TokenStream2, fields: &Fields, names: &[Ident]) -> TokenStream2 {
    match fields {
        Fields::Named(_) => quote! { #path { #(#names),* } },
        Fields::Unnamed(_) => quote! { #path ( #(#names),* ) },
        Fields::Unit => path,
    }
}

/// The tag byte written for each variant: its explicit discriminant, or its index when none is
/// given
fn variant_tags(data: &DataEnum) -> Vec<TokenStream2> {
    data.variants
        .iter()
        .enumerate()
        .map(|(idx, v)| match &v.discriminant {
            Some((_, expr)) => quote! { ((#expr) as u8) },
            None => {
                let idx = idx as u8;
                quote! { #idx }
            }
        })
        .collect()
}

fn derive_tobytes_struct(ident: Ident, generics: Generics, data: DataStruct) -> TokenStream {
    let (name, ty) = field_name_type_iter(data.fields.into_iter());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let implementation = quote! {
        impl #impl_generics ::cmix_wireformat::ToBytes for #ident #ty_generics #where_clause {
            fn encode<B: ::cmix_wireformat::ByteWriter>(&self, writer: &mut B) -> ::core::result::Result<(), ::cmix_wireformat::ToBytesError> {
                #( <#ty as ::cmix_wireformat::ToBytes>::encode(&self.#name, writer)?; )*
                ::core::result::Result::<(), ::cmix_wireformat::ToBytesError>::Ok(())
            }

            fn size_hint(&self) -> usize {
                0 #( + <#ty as ::cmix_wireformat::ToBytes>::size_hint(&self.#name) )*
            }
        }
    };

    TokenStream::from(implementation)
}

fn derive_frombytes_struct(ident: Ident, data: DataStruct) -> TokenStream {
    let is_named = matches!(data.fields, Fields::Named(_));
    let is_unit = !is_named && data.fields.is_empty();
    let (name, ty) = field_name_type_iter(data.fields.into_iter());
    let binding = (0..name.len())
        .map(|idx| format_ident!("__field{}", idx))
        .collect::<Vec<_>>();

    let constructor = match is_named {
        true => quote! { #ident { #(#name: #binding),* } },
        false => match is_unit {
            true => quote! { #ident },
            false => quote! { #ident(#(#binding),*) },
        },
    };

    let implementation = quote! {
        impl<'a> ::cmix_wireformat::FromBytes<'a> for #ident {
            fn decode(reader: &mut ::cmix_wireformat::untrusted::Reader<'a>) -> ::core::result::Result<Self, ::cmix_wireformat::FromBytesError> {
                #( let #binding = <#ty as ::cmix_wireformat::FromBytes<'a>>::decode(reader)?; )*

                Ok(#constructor)
            }
        }
    };

    TokenStream::from(implementation)
}

fn derive_tobytes_enum(ident: Ident, generics: Generics, data: DataEnum) -> TokenStream {
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let tags = variant_tags(&data);

    let arms = data.variants.iter().zip(tags.iter()).map(|(variant, tag)| {
        let vident = &variant.ident;
        let names = binding_names(&variant.fields);
        let pattern = variant_shape(quote! { Self::#vident }, &variant.fields, &names);
        let tys = variant.fields.iter().map(|f| &f.ty);

        quote! {
            #pattern => {
                <u8 as ::cmix_wireformat::ToBytes>::encode(&#tag, writer)?;
                #( <#tys as ::cmix_wireformat::ToBytes>::encode(#names, writer)?; )*
            }
        }
    });

    let hint_arms = data.variants.iter().map(|variant| {
        let vident = &variant.ident;
        let names = binding_names(&variant.fields);
        let pattern = variant_shape(quote! { Self::#vident }, &variant.fields, &names);
        let tys = variant.fields.iter().map(|f| &f.ty);

        quote! {
            #pattern => 1 #( + <#tys as ::cmix_wireformat::ToBytes>::size_hint(#names) )*
        }
    });

    let implementation = quote! {
        impl #impl_generics ::cmix_wireformat::ToBytes for #ident #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<B: ::cmix_wireformat::ByteWriter>(&self, writer: &mut B) -> ::core::result::Result<(), ::cmix_wireformat::ToBytesError> {
                match self {
                    #( #arms )*
                }
                ::core::result::Result::<(), ::cmix_wireformat::ToBytesError>::Ok(())
            }

            #[allow(unused_variables)]
            fn size_hint(&self) -> usize {
                match self {
                    #( #hint_arms, )*
                }
            }
        }
    };

    TokenStream::from(implementation)
}

fn derive_frombytes_enum(ident: Ident, data: DataEnum) -> TokenStream {
    let tags = variant_tags(&data);

    let branches = data.variants.iter().zip(tags.iter()).map(|(variant, tag)| {
        let vident = &variant.ident;
        let names = binding_names(&variant.fields);
        let constructor = variant_shape(quote! { #ident::#vident }, &variant.fields, &names);
        let tys = variant.fields.iter().map(|f| &f.ty);

        quote! {
            if tag == #tag {
                #( let #names = <#tys as ::cmix_wireformat::FromBytes<'a>>::decode(reader)?; )*
                return Ok(#constructor);
            }
        }
    });

    let name = ident.to_string();

    let implementation = quote! {
        impl<'a> ::cmix_wireformat::FromBytes<'a> for #ident {
            fn decode(reader: &mut ::cmix_wireformat::untrusted::Reader<'a>) -> ::core::result::Result<Self, ::cmix_wireformat::FromBytesError> {
                let tag = <u8 as ::cmix_wireformat::FromBytes<'a>>::decode(reader)?;
                #( #branches )*

                Err(::cmix_wireformat::FromBytesError::Parsing(format!("Unknown {} tag {:X}", #name, tag)))
            }
        }
    };

    TokenStream::from(implementation)
}
