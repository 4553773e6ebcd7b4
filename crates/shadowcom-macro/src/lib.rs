//! Procedural macros for shadowcom
//!
//! Provides:
//! - `#[shadow_interface("guid", ...)]` - Declare a callback interface that native code can call
//!   through a shadow vtable
//!
//! ## Calling Conventions
//!
//! **COM layout (default):**
//! - x86: `stdcall` (this on stack)
//! - x64: `C` (this as first param)
//!
//! **Plain layout (`plain`):**
//! - x86: `cdecl` by default, `stdcall` or `thiscall` on request
//! - x64: `C` (this as first param)
//!
//! Supports explicit slot indices via `#[slot(N)]` attribute on methods.
//!
//! ## Return Mapping
//!
//! | Trait signature                  | Native signature                    |
//! |----------------------------------|-------------------------------------|
//! | `fn f(&self, ..)`                | `fn(this, ..)`                      |
//! | `fn f(&self, ..) -> T`           | `fn(this, ..) -> T`                 |
//! | `fn f(&self, ..) -> CallbackResult` | `fn(this, ..) -> HRESULT`        |
//! | `fn f(&self, ..) -> CallbackResult<T>` | `fn(this, .., *mut T) -> HRESULT` |

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Attribute, Expr, FnArg, GenericArgument, Ident, ItemTrait, Lit, Meta, Pat, PathArguments,
    ReturnType, TraitItem, Type, parse_macro_input, spanned::Spanned,
};

/// Path to the runtime crate in generated code.
fn crate_path() -> TokenStream2 {
    quote! { ::shadowcom }
}

// =============================================================================
// Configuration
// =============================================================================

/// Calling convention for generated thunks on x86
#[derive(Clone, Copy, PartialEq, Eq)]
enum CallingConvention {
    Cdecl,
    Stdcall,
    Thiscall,
}

/// Configuration parsed from the attribute
struct InterfaceConfig {
    /// Interface ID
    guid: (u32, u16, u16, [u8; 8]),
    /// Base interface (must itself be a shadow interface)
    base_interface: Option<syn::Path>,
    /// Plain C++ layout without the IUnknown prefix
    plain: bool,
    /// Explicit convention, if any
    calling_convention: Option<CallingConvention>,
}

impl InterfaceConfig {
    fn convention(&self) -> CallingConvention {
        match self.calling_convention {
            Some(cc) => cc,
            None if self.plain => CallingConvention::Cdecl,
            None => CallingConvention::Stdcall,
        }
    }

    /// Generate the x86 calling convention token
    fn x86_calling_conv(&self) -> TokenStream2 {
        match self.convention() {
            CallingConvention::Cdecl => quote! { "C" },
            CallingConvention::Stdcall => quote! { "stdcall" },
            CallingConvention::Thiscall => quote! { "thiscall" },
        }
    }

    fn convention_tokens(&self, krate: &TokenStream2) -> TokenStream2 {
        match self.convention() {
            CallingConvention::Cdecl => quote! { #krate::CallingConvention::Cdecl },
            CallingConvention::Stdcall => quote! { #krate::CallingConvention::Stdcall },
            CallingConvention::Thiscall => quote! { #krate::CallingConvention::Thiscall },
        }
    }
}

// =============================================================================
// Validation helpers for FFI-safety
// =============================================================================

/// Check if a type is known to be non-FFI-safe
fn check_ffi_safe_type(ty: &Type) -> Result<(), String> {
    match ty {
        Type::Path(type_path) => {
            if let Some(segment) = type_path.path.segments.last() {
                let name = segment.ident.to_string();
                match name.as_str() {
                    "String" => {
                        return Err(
                            "String is not FFI-safe. Use *const c_char or *const u8 instead".into(),
                        );
                    }
                    "Vec" => {
                        return Err(
                            "Vec<T> is not FFI-safe. Use *const T and a length parameter instead"
                                .into(),
                        );
                    }
                    "Box" => return Err("Box<T> is not FFI-safe. Use *mut T instead".into()),
                    "Rc" | "Arc" => {
                        return Err(format!(
                            "{} is not FFI-safe. Use raw pointers instead",
                            name
                        ));
                    }
                    "Result" | "CallbackResult" => {
                        return Err(
                            "Result is only supported as a return type (CallbackResult<T>)".into(),
                        );
                    }
                    "str" => {
                        return Err(
                            "str is not FFI-safe. Use *const c_char or *const u8 instead".into(),
                        );
                    }
                    _ => {}
                }
            }
        }
        Type::Reference(type_ref) => {
            let mutability = if type_ref.mutability.is_some() {
                "&mut "
            } else {
                "&"
            };
            return Err(format!(
                "{}T references cannot cross the native boundary. Use *const T or *mut T instead",
                mutability
            ));
        }
        Type::Slice(_) => {
            return Err(
                "Slices [T] are not FFI-safe. Use *const T and a length parameter instead".into(),
            );
        }
        Type::TraitObject(_) => {
            return Err("Trait objects (dyn Trait) are not FFI-safe".into());
        }
        Type::ImplTrait(_) => {
            return Err("impl Trait is not FFI-safe".into());
        }
        Type::Tuple(tuple) if !tuple.elems.is_empty() => {
            return Err(
                "Non-empty tuples are not FFI-safe. Use a #[repr(C)] struct instead".into(),
            );
        }
        _ => {}
    }
    Ok(())
}

/// How a trait method's return value crosses the boundary
enum ReturnKind {
    /// No return value
    Void,
    /// Plain value, `Default` on failure
    Value(Type),
    /// `CallbackResult` mapped to an HRESULT
    Status,
    /// `CallbackResult<T>` mapped to an out-parameter plus HRESULT
    Out(Type),
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

fn classify_return(method_name: &Ident, output: &ReturnType) -> Result<ReturnKind, syn::Error> {
    let ty = match output {
        ReturnType::Default => return Ok(ReturnKind::Void),
        ReturnType::Type(_, ty) => ty.as_ref(),
    };
    if is_unit(ty) {
        return Ok(ReturnKind::Void);
    }

    let Type::Path(type_path) = ty else {
        check_ffi_safe_type(ty).map_err(|msg| {
            syn::Error::new(ty.span(), format!("method '{}': return type - {}", method_name, msg))
        })?;
        return Ok(ReturnKind::Value(ty.clone()));
    };
    let Some(segment) = type_path.path.segments.last() else {
        return Ok(ReturnKind::Value(ty.clone()));
    };

    let name = segment.ident.to_string();
    if name != "CallbackResult" && name != "Result" {
        check_ffi_safe_type(ty).map_err(|msg| {
            syn::Error::new(ty.span(), format!("method '{}': return type - {}", method_name, msg))
        })?;
        return Ok(ReturnKind::Value(ty.clone()));
    }

    let args: Vec<&Type> = match &segment.arguments {
        PathArguments::None => Vec::new(),
        PathArguments::AngleBracketed(generic) => generic
            .args
            .iter()
            .filter_map(|arg| match arg {
                GenericArgument::Type(ty) => Some(ty),
                _ => None,
            })
            .collect(),
        PathArguments::Parenthesized(_) => {
            return Err(syn::Error::new(
                segment.span(),
                format!("method '{}': unsupported return type", method_name),
            ));
        }
    };

    if name == "Result" {
        let error_is_callback = args.get(1).is_some_and(|ty| {
            matches!(ty, Type::Path(p) if p.path.segments.last().is_some_and(|s| s.ident == "CallbackError"))
        });
        if args.len() != 2 || !error_is_callback {
            return Err(syn::Error::new(
                ty.span(),
                format!(
                    "method '{}': fallible methods must return CallbackResult<T> or Result<T, CallbackError>",
                    method_name
                ),
            ));
        }
    }

    match args.first() {
        None => Ok(ReturnKind::Status),
        Some(inner) if is_unit(inner) => Ok(ReturnKind::Status),
        Some(inner) => {
            check_ffi_safe_type(inner).map_err(|msg| {
                syn::Error::new(
                    inner.span(),
                    format!("method '{}': out value - {}", method_name, msg),
                )
            })?;
            Ok(ReturnKind::Out((*inner).clone()))
        }
    }
}

/// Validate a trait method signature for shadow dispatch
fn validate_trait_method(method: &syn::TraitItemFn) -> Result<(), syn::Error> {
    let method_name = &method.sig.ident;
    let span = method_name.span();

    if method.sig.asyncness.is_some() {
        return Err(syn::Error::new(
            span,
            format!(
                "method '{}': async functions cannot be called from native code",
                method_name
            ),
        ));
    }

    if !method.sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            span,
            format!(
                "method '{}': generic methods cannot be placed in a vtable",
                method_name
            ),
        ));
    }

    let receiver = method.sig.inputs.iter().find_map(|arg| match arg {
        FnArg::Receiver(receiver) => Some(receiver),
        FnArg::Typed(_) => None,
    });
    let Some(receiver) = receiver else {
        return Err(syn::Error::new(
            span,
            format!(
                "method '{}': must take &self (native callers always pass a this pointer)",
                method_name
            ),
        ));
    };
    if receiver.reference.is_none() || receiver.mutability.is_some() {
        return Err(syn::Error::new(
            receiver.self_token.span(),
            format!(
                "method '{}': only &self is supported, callbacks may be entered from several threads",
                method_name
            ),
        ));
    }

    for arg in &method.sig.inputs {
        if let FnArg::Typed(pat_type) = arg
            && let Err(msg) = check_ffi_safe_type(&pat_type.ty)
        {
            return Err(syn::Error::new(
                pat_type.ty.span(),
                format!("method '{}': {}", method_name, msg),
            ));
        }
    }

    Ok(())
}

/// Validate a trait definition for shadow dispatch
fn validate_trait(input: &ItemTrait) -> Result<(), syn::Error> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "generic traits cannot be shadow interfaces",
        ));
    }

    for item in &input.items {
        if let TraitItem::Fn(method) = item {
            validate_trait_method(method)?;
        }
    }

    Ok(())
}

/// Parse `#[slot(N)]` from a list of attributes.
fn parse_slot_attr(attrs: &[Attribute]) -> Option<usize> {
    for attr in attrs {
        if attr.path().is_ident("slot")
            && let Meta::List(meta_list) = &attr.meta
            && let Ok(Expr::Lit(expr_lit)) = syn::parse2::<Expr>(meta_list.tokens.clone())
            && let Lit::Int(lit_int) = &expr_lit.lit
        {
            return lit_int.base10_parse::<usize>().ok();
        }
    }
    None
}

// =============================================================================
// Code generation
// =============================================================================

fn shadow_interface_internal(
    config: InterfaceConfig,
    mut input: ItemTrait,
) -> Result<TokenStream2, syn::Error> {
    validate_trait(&input)?;

    let krate = crate_path();
    let trait_name = input.ident.clone();
    let trait_name_str = trait_name.to_string();
    let x86_cc = config.x86_calling_conv();
    let iid_const = format_ident!("IID_{}", trait_name_str.to_uppercase());
    let (data1, data2, data3, data4) = config.guid;

    let mut thunks = Vec::new();
    let mut slot_decls = Vec::new();

    for item in &mut input.items {
        let TraitItem::Fn(method) = item else {
            continue;
        };

        let slot = parse_slot_attr(&method.attrs);
        method.attrs.retain(|attr| !attr.path().is_ident("slot"));

        let method_name = method.sig.ident.clone();
        let method_name_str = method_name.to_string();
        let thunk_name = format_ident!("__shadow_{}_{}", trait_name, method_name);

        let mut param_names = Vec::new();
        let mut param_types = Vec::new();
        for (index, arg) in method.sig.inputs.iter().enumerate() {
            if let FnArg::Typed(pat_type) = arg {
                let name = match pat_type.pat.as_ref() {
                    Pat::Ident(pat_ident) if pat_ident.ident != "this" => pat_ident.ident.clone(),
                    _ => format_ident!("__arg{}", index),
                };
                param_names.push(name);
                param_types.push((*pat_type.ty).clone());
            }
        }

        let kind = classify_return(&method_name, &method.sig.output)?;
        let (extra_param, native_ret, body) = match &kind {
            ReturnKind::Void => (
                quote! {},
                quote! {},
                quote! {
                    #krate::thunk::dispatch_void::<dyn #trait_name, _>(this, |target| {
                        target.#method_name(#(#param_names),*)
                    })
                },
            ),
            ReturnKind::Value(ty) => (
                quote! {},
                quote! { -> #ty },
                quote! {
                    #krate::thunk::dispatch_value::<dyn #trait_name, #ty, _>(this, |target| {
                        target.#method_name(#(#param_names),*)
                    })
                },
            ),
            ReturnKind::Status => (
                quote! {},
                quote! { -> #krate::HRESULT },
                quote! {
                    #krate::thunk::dispatch_status::<dyn #trait_name, _>(this, |target| {
                        target.#method_name(#(#param_names),*)
                    })
                },
            ),
            ReturnKind::Out(ty) => (
                quote! { , __out: *mut #ty },
                quote! { -> #krate::HRESULT },
                quote! {
                    #krate::thunk::dispatch_out::<dyn #trait_name, #ty, _>(this, __out, |target| {
                        target.#method_name(#(#param_names),*)
                    })
                },
            ),
        };

        thunks.push(quote! {
            #[doc(hidden)]
            #[allow(non_snake_case)]
            #[cfg(target_arch = "x86")]
            unsafe extern #x86_cc fn #thunk_name(
                this: *mut ::std::ffi::c_void
                #(, #param_names: #param_types)*
                #extra_param
            ) #native_ret {
                unsafe { #body }
            }

            #[doc(hidden)]
            #[allow(non_snake_case)]
            #[cfg(not(target_arch = "x86"))]
            unsafe extern "C" fn #thunk_name(
                this: *mut ::std::ffi::c_void
                #(, #param_names: #param_types)*
                #extra_param
            ) #native_ret {
                unsafe { #body }
            }
        });

        let function = quote! { #krate::SlotFn::new(#thunk_name as *const ::std::ffi::c_void) };
        slot_decls.push(match slot {
            Some(index) => quote! { .slot_at(#index, #method_name_str, #function) },
            None => quote! { .slot(#method_name_str, #function) },
        });
    }

    // Every view is shared across threads
    input.supertraits.push(syn::parse_quote!(::std::marker::Send));
    input.supertraits.push(syn::parse_quote!(::std::marker::Sync));
    if input.colon_token.is_none() {
        input.colon_token = Some(Default::default());
    }

    let layout = if config.plain {
        quote! { #krate::VtableLayout::Plain }
    } else {
        quote! { #krate::VtableLayout::Com }
    };
    let convention = config.convention_tokens(&krate);
    let vis = &input.vis;

    let (extends, register_bases, expose_bases) = match &config.base_interface {
        Some(base) => (
            quote! { .extends(<dyn #base as #krate::ShadowInterface>::IID) },
            quote! {
                registry.ensure_registered::<dyn #base>()?;
                Ok(())
            },
            quote! {
                let base: ::std::sync::Arc<dyn #base> = view.clone();
                views.insert::<dyn #base>(&base);
                <dyn #base as #krate::ShadowInterface>::expose_bases(&base, views);
            },
        ),
        None => (quote! {}, quote! { Ok(()) }, quote! { let _ = (view, views); }),
    };

    let doc = format!("Interface ID for [`{}`]", trait_name_str);

    Ok(quote! {
        #input

        #[doc = #doc]
        #vis const #iid_const: #krate::GUID =
            #krate::GUID::new(#data1, #data2, #data3, [#(#data4),*]);

        #(#thunks)*

        unsafe impl #krate::ShadowInterface for dyn #trait_name {
            const IID: #krate::GUID = #iid_const;
            const NAME: &'static str = #trait_name_str;

            fn declaration() -> #krate::InterfaceDecl {
                #krate::InterfaceDecl::new(#iid_const, #trait_name_str, #layout, #convention)
                    #extends
                    #(#slot_decls)*
            }

            fn register_bases(registry: &#krate::VtableRegistry) -> #krate::Result<()> {
                #register_bases
            }

            fn expose_bases(
                view: &::std::sync::Arc<Self>,
                views: &mut #krate::InterfaceViews,
            ) {
                #expose_bases
            }
        }
    })
}

/// Declare a callback interface that native code can invoke through a shadow vtable.
///
/// This generates:
/// - The trait itself, with `Send + Sync` supertraits added
/// - An IID constant `IID_{NAME}` parsed from the GUID string
/// - One native-callable thunk per method
/// - `impl ShadowInterface for dyn Trait`, which describes the vtable to a `VtableRegistry`
///
/// Options after the GUID:
/// - `extends(Base)` - inherit the slots of another shadow interface
/// - `plain` - no IUnknown prefix (plain C++ vtable)
/// - `cdecl` / `stdcall` / `thiscall` - x86 calling convention
///
/// # Example
/// ```ignore
/// #[shadow_interface("12345678-1234-1234-1234-123456789abc")]
/// pub trait ICounter {
///     fn increment(&self, value: i32) -> i32;
///     fn reset(&self) -> CallbackResult;
///     #[slot(4)]
///     fn total(&self) -> CallbackResult<i64>;  // slot 3 + 4; the gap is reserved
/// }
/// ```
#[proc_macro_attribute]
pub fn shadow_interface(attr: TokenStream, item: TokenStream) -> TokenStream {
    let config = match parse_interface_config(attr) {
        Ok(config) => config,
        Err(err) => return err.to_compile_error().into(),
    };

    let input = parse_macro_input!(item as ItemTrait);
    match shadow_interface_internal(config, input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn parse_interface_config(attr: TokenStream) -> Result<InterfaceConfig, syn::Error> {
    let attr2: TokenStream2 = attr.into();
    let tokens: Vec<_> = attr2.into_iter().collect();

    let mut guid = None;
    let mut base_interface = None;
    let mut plain = false;
    let mut calling_convention = None;

    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            proc_macro2::TokenTree::Literal(literal) => {
                let lit: syn::LitStr =
                    syn::parse2(proc_macro2::TokenTree::Literal(literal.clone()).into())
                        .map_err(|_| syn::Error::new(literal.span(), "expected a GUID string"))?;
                guid = Some(
                    parse_guid_string(&lit.value())
                        .map_err(|e| syn::Error::new(lit.span(), e))?,
                );
                i += 1;
            }
            proc_macro2::TokenTree::Ident(ident) => {
                let name = ident.to_string();
                match name.as_str() {
                    "cdecl" => {
                        calling_convention = Some(CallingConvention::Cdecl);
                        i += 1;
                    }
                    "stdcall" => {
                        calling_convention = Some(CallingConvention::Stdcall);
                        i += 1;
                    }
                    "thiscall" => {
                        calling_convention = Some(CallingConvention::Thiscall);
                        i += 1;
                    }
                    "plain" => {
                        plain = true;
                        i += 1;
                    }
                    "extends" => {
                        // Expect: extends(BaseInterface)
                        i += 1;
                        if let Some(proc_macro2::TokenTree::Group(group)) = tokens.get(i) {
                            let base: syn::Path = syn::parse2(group.stream()).map_err(|_| {
                                syn::Error::new(
                                    group.span(),
                                    "expected an interface path inside 'extends(...)'",
                                )
                            })?;
                            base_interface = Some(base);
                            i += 1;
                        } else {
                            return Err(syn::Error::new(
                                ident.span(),
                                "expected '(...)' after 'extends'",
                            ));
                        }
                    }
                    _ => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!(
                                "unknown option '{}'. Expected: extends, plain, cdecl, stdcall, thiscall",
                                name
                            ),
                        ));
                    }
                }
            }
            proc_macro2::TokenTree::Punct(p) if p.as_char() == ',' => {
                i += 1;
            }
            other => {
                return Err(syn::Error::new(other.span(), "unexpected token"));
            }
        }
    }

    let Some(guid) = guid else {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "expected an interface GUID, e.g. #[shadow_interface(\"12345678-1234-1234-1234-123456789abc\")]",
        ));
    };

    if !plain && calling_convention == Some(CallingConvention::Thiscall) {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "COM interfaces use stdcall; add 'plain' for a thiscall vtable",
        ));
    }

    Ok(InterfaceConfig {
        guid,
        base_interface,
        plain,
        calling_convention,
    })
}

/// Parse GUID string "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx" into components
fn parse_guid_string(s: &str) -> Result<(u32, u16, u16, [u8; 8]), String> {
    let s = s.trim().trim_start_matches('{').trim_end_matches('}');
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 5 || !s.is_ascii() {
        return Err(format!(
            "Invalid GUID format: expected 'xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx', got '{}'",
            s
        ));
    }

    let data1 = u32::from_str_radix(parts[0], 16)
        .map_err(|_| format!("Invalid GUID data1: '{}'", parts[0]))?;
    let data2 = u16::from_str_radix(parts[1], 16)
        .map_err(|_| format!("Invalid GUID data2: '{}'", parts[1]))?;
    let data3 = u16::from_str_radix(parts[2], 16)
        .map_err(|_| format!("Invalid GUID data3: '{}'", parts[2]))?;

    if parts[3].len() != 4 {
        return Err(format!(
            "Invalid GUID data4 first part: expected 4 hex chars, got '{}'",
            parts[3]
        ));
    }
    if parts[4].len() != 12 {
        return Err(format!(
            "Invalid GUID data4 second part: expected 12 hex chars, got '{}'",
            parts[4]
        ));
    }

    let tail = format!("{}{}", parts[3], parts[4]);
    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        let pair = &tail[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| format!("Invalid GUID data4[{}]: '{}'", i, pair))?;
    }

    Ok((data1, data2, data3, data4))
}
