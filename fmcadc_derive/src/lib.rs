use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Expr};

#[proc_macro_derive(RegisterWord)]
/// Derived on a 32-bit packed_struct so it can be moved through a `Transport` as one word
pub fn derive_register_word(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let word_name = input.ident;
    let generated = quote! {
        impl Serialize for #word_name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn serialize(&self) -> ::core::result::Result<Self::Chunk, crate::transport::Error> {
                Ok(self.pack()?)
            }
        }

        impl Deserialize for #word_name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn deserialize(chunk: Self::Chunk) -> ::core::result::Result<Self, crate::transport::Error> {
                Ok(Self::unpack(&chunk)?)
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attaches the byte offset of a register word, e.g. `#[offset(FA_IRQ_MEM_OFF + 0x04)]`
pub fn offset(attr: TokenStream, item: TokenStream) -> TokenStream {
    let offset = parse_macro_input!(attr as Expr);
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.ident.clone();

    let generated = quote! {
        impl Located for #ident {
            const OFFSET: u32 = #offset;
        }
        #item
    };
    TokenStream::from(generated)
}
