use std::collections::HashSet;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Error, Ident, LitStr, Result, ReturnType, Token, Type, Visibility, braced, parenthesized, parse_macro_input};

mod kw {
	syn::custom_keyword!(service);
	syn::custom_keyword!(methods);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PrimaryProfile {
	Personal,
	Work,
	None,
}

struct ServiceInput {
	vis: Visibility,
	name: Ident,
	connector: Option<LitStr>,
	policy: Option<Ident>,
	primary_profile: Option<PrimaryProfile>,
	methods: Vec<MethodDecl>,
}

impl Parse for ServiceInput {
	fn parse(input: ParseStream<'_>) -> Result<Self> {
		let vis: Visibility = input.parse()?;
		input.parse::<kw::service>()?;
		let name: Ident = input.parse()?;

		let content;
		braced!(content in input);

		let mut connector = None;
		let mut policy = None;
		let mut primary_profile = None;
		let mut methods = None;

		while !content.is_empty() {
			if content.peek(kw::methods) {
				let key = content.parse::<kw::methods>()?;
				if methods.is_some() {
					return Err(Error::new(key.span, "duplicate 'methods' section"));
				}
				let body;
				braced!(body in content);
				let mut parsed = Vec::new();
				while !body.is_empty() {
					parsed.push(body.parse::<MethodDecl>()?);
				}
				methods = Some(parsed);
			} else {
				let key: Ident = content.parse()?;
				content.parse::<Token![:]>()?;

				match key.to_string().as_str() {
					"connector" => {
						if connector.is_some() {
							return Err(Error::new(key.span(), "duplicate 'connector' field"));
						}
						let value: LitStr = content.parse()?;
						if value.value().trim().is_empty() {
							return Err(Error::new(value.span(), "connector name must not be empty"));
						}
						connector = Some(value);
					}
					"policy" => {
						if policy.is_some() {
							return Err(Error::new(key.span(), "duplicate 'policy' field"));
						}
						let value: Ident = content.parse()?;
						match value.to_string().as_str() {
							"NotifyRethrow" | "NotifySuppress" => policy = Some(value),
							other => {
								return Err(Error::new(
									value.span(),
									format!("unknown policy '{other}', expected NotifyRethrow or NotifySuppress"),
								));
							}
						}
					}
					"primary_profile" => {
						if primary_profile.is_some() {
							return Err(Error::new(key.span(), "duplicate 'primary_profile' field"));
						}
						let value: Ident = content.parse()?;
						primary_profile = Some(match value.to_string().as_str() {
							"Personal" => PrimaryProfile::Personal,
							"Work" => PrimaryProfile::Work,
							"None" => PrimaryProfile::None,
							other => {
								return Err(Error::new(
									value.span(),
									format!("unknown profile '{other}', expected Personal, Work or None"),
								));
							}
						});
					}
					other => {
						return Err(Error::new(
							key.span(),
							format!("unsupported field '{other}', expected connector/policy/primary_profile/methods"),
						));
					}
				}
			}

			if content.peek(Token![,]) {
				content.parse::<Token![,]>()?;
			}
		}

		let methods = methods.ok_or_else(|| Error::new(name.span(), "missing required 'methods' section"))?;

		let mut seen = HashSet::new();
		for method in &methods {
			if !seen.insert(method.name.to_string()) {
				return Err(Error::new(method.name.span(), format!("duplicate method '{}'", method.name)));
			}
		}

		Ok(Self {
			vis,
			name,
			connector,
			policy,
			primary_profile,
			methods,
		})
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParamRole {
	Value,
	Key,
	Callback,
}

struct ParamDecl {
	name: Ident,
	role: ParamRole,
	ty: Option<Type>,
}

impl Parse for ParamDecl {
	fn parse(input: ParseStream<'_>) -> Result<Self> {
		let attrs = input.call(Attribute::parse_outer)?;
		let name: Ident = input.parse()?;

		let mut role = ParamRole::Value;
		for attr in &attrs {
			let next = if attr.path().is_ident("key") {
				ParamRole::Key
			} else if attr.path().is_ident("callback") {
				ParamRole::Callback
			} else {
				return Err(Error::new_spanned(attr, "unsupported parameter attribute, expected #[key] or #[callback]"));
			};
			if role != ParamRole::Value {
				return Err(Error::new_spanned(attr, "a parameter takes at most one of #[key] and #[callback]"));
			}
			role = next;
		}

		let ty = if input.peek(Token![:]) {
			input.parse::<Token![:]>()?;
			Some(input.parse::<Type>()?)
		} else {
			None
		};

		match (role, &ty) {
			(ParamRole::Callback, Some(ty)) => Err(Error::new_spanned(ty, "callback parameters take no type")),
			(ParamRole::Value | ParamRole::Key, None) => Err(Error::new(name.span(), format!("parameter '{name}' needs a type"))),
			_ => Ok(Self { name, role, ty }),
		}
	}
}

struct MethodDecl {
	name: Ident,
	cacheable: bool,
	params: Vec<ParamDecl>,
	returns: Option<Type>,
}

impl Parse for MethodDecl {
	fn parse(input: ParseStream<'_>) -> Result<Self> {
		let attrs = input.call(Attribute::parse_outer)?;
		let mut cacheable = false;
		for attr in &attrs {
			if attr.path().is_ident("cacheable") {
				cacheable = true;
			} else {
				return Err(Error::new_spanned(attr, "unsupported method attribute, expected #[cacheable]"));
			}
		}

		input.parse::<Token![fn]>()?;
		let name: Ident = input.parse()?;

		let content;
		parenthesized!(content in input);
		let params = content.parse_terminated(ParamDecl::parse, Token![,])?.into_iter().collect::<Vec<_>>();

		let returns = match input.parse::<ReturnType>()? {
			ReturnType::Default => None,
			ReturnType::Type(_, ty) => match *ty {
				Type::Tuple(ref tuple) if tuple.elems.is_empty() => None,
				ty => Some(ty),
			},
		};
		input.parse::<Token![;]>()?;

		let mut seen = HashSet::new();
		for param in &params {
			if !seen.insert(param.name.to_string()) {
				return Err(Error::new(param.name.span(), format!("duplicate parameter '{}'", param.name)));
			}
		}
		if cacheable && returns.is_none() {
			return Err(Error::new(name.span(), "void methods cannot be cacheable"));
		}
		if cacheable && params.iter().any(|param| param.role == ParamRole::Callback) {
			return Err(Error::new(name.span(), "cacheable methods cannot take callback parameters"));
		}

		Ok(Self {
			name,
			cacheable,
			params,
			returns,
		})
	}
}

impl MethodDecl {
	fn descriptor(&self) -> TokenStream2 {
		let name = self.name.to_string();
		let params = self.params.iter().map(|param| {
			let param_name = param.name.to_string();
			let ty = param.ty.as_ref().map(type_name);
			match param.role {
				ParamRole::Value => quote! { .param(#param_name, #ty) },
				ParamRole::Key => quote! { .key(#param_name, #ty) },
				ParamRole::Callback => quote! { .callback(#param_name) },
			}
		});
		let returns = self.returns.as_ref().map(|ty| {
			let ty = type_name(ty);
			quote! { .returns(#ty) }
		});
		let cacheable = self.cacheable.then(|| quote! { .cacheable() });

		quote! {
			::xprofile::MethodDescriptor::new(#name) #(#params)* #returns #cacheable
		}
	}

	fn return_type(&self) -> TokenStream2 {
		match &self.returns {
			Some(ty) => quote! { #ty },
			None => quote! { () },
		}
	}

	fn target_signature(&self) -> TokenStream2 {
		let name = &self.name;
		let ret = self.return_type();
		let params = self.params.iter().map(|param| {
			let param_name = &param.name;
			match &param.ty {
				Some(ty) => quote! { #param_name: #ty },
				None => quote! { #param_name: ::xprofile::CallbackHandle },
			}
		});
		quote! {
			async fn #name(&self, #(#params),*) -> ::std::result::Result<#ret, ::xprofile::MethodFailure>
		}
	}

	fn adapter_arm(&self, service: &str) -> TokenStream2 {
		let name = &self.name;
		let method = name.to_string();
		let mut value_index = 0usize;
		let bindings = self.params.iter().map(|param| {
			let param_name = &param.name;
			let param_str = param_name.to_string();
			match &param.ty {
				Some(ty) => {
					let index = value_index;
					value_index += 1;
					quote! {
						let #param_name: #ty = ::xprofile::codec::decode_arg(&args, #index, #param_str)?;
					}
				}
				None => {
					let missing = format!("{service}.{method}: missing callback '{param_str}'");
					quote! {
						let #param_name = callbacks
							.next()
							.ok_or_else(|| ::xprofile::MethodFailure::new("InvalidArguments", #missing))?;
					}
				}
			}
		});
		let bindings = bindings.collect::<Vec<_>>();
		let names = self.params.iter().map(|param| &param.name);

		quote! {
			#method => {
				#(#bindings)*
				let result = self.0.#name(#(#names),*).await?;
				::xprofile::codec::encode_result(&result)
			}
		}
	}

	fn caller_params(&self) -> Vec<TokenStream2> {
		self.params
			.iter()
			.map(|param| {
				let param_name = &param.name;
				match &param.ty {
					Some(ty) => quote! { #param_name: #ty },
					None => quote! { #param_name: ::std::sync::Arc<dyn ::xprofile::CallbackSink> },
				}
			})
			.collect()
	}

	fn marshal(&self) -> TokenStream2 {
		let args = self.params.iter().filter(|param| param.ty.is_some()).map(|param| {
			let param_name = &param.name;
			quote! { ::xprofile::codec::encode(&#param_name)? }
		});
		let sinks = self.params.iter().filter(|param| param.ty.is_none()).map(|param| &param.name);
		quote! {
			let args: ::std::vec::Vec<::xprofile::Value> = vec![#(#args),*];
			let sinks: ::std::vec::Vec<::std::sync::Arc<dyn ::xprofile::CallbackSink>> = vec![#(#sinks),*];
		}
	}

	fn single_method(&self) -> TokenStream2 {
		let name = &self.name;
		let method = name.to_string();
		let ret = self.return_type();
		let params = self.caller_params();
		let marshal = self.marshal();
		quote! {
			pub async fn #name(&self, #(#params),*) -> ::xprofile::Result<::std::option::Option<#ret>> {
				#marshal
				let value = self.sender.call_with_callbacks(#method, args, sinks).await?;
				value.map(::xprofile::codec::decode::<#ret>).transpose()
			}
		}
	}

	fn multi_method(&self) -> TokenStream2 {
		let name = &self.name;
		let method = name.to_string();
		let ret = self.return_type();
		let params = self.caller_params();
		let marshal = self.marshal();
		quote! {
			pub async fn #name(
				&self,
				#(#params),*
			) -> ::xprofile::Result<::std::collections::BTreeMap<::xprofile::Profile, ::xprofile::Result<::std::option::Option<#ret>>>> {
				#marshal
				let results = self.sender.call_with_callbacks(#method, args, sinks).await?;
				Ok(results
					.into_iter()
					.map(|(profile, outcome)| (profile, outcome.and_then(|value| value.map(::xprofile::codec::decode::<#ret>).transpose())))
					.collect())
			}
		}
	}
}

fn type_name(ty: &Type) -> String {
	quote!(#ty).to_string().replace(" < ", "<").replace(" >", ">").replace(" , ", ", ")
}

/// Declares a cross-profile service and generates its profile-aware surface.
///
/// ```ignore
/// cross_profile_type! {
///     pub service Notes {
///         connector: "notes",
///         policy: NotifySuppress,
///         primary_profile: Work,
///         methods {
///             #[cacheable]
///             fn count(#[key] folder: String, verbose: bool) -> u32;
///             fn sync(force: bool, #[callback] progress);
///         }
///     }
/// }
/// ```
///
/// Emits `Notes` (descriptor and factories), the `NotesTarget` trait for
/// implementations, `NotesAdapter`, and the typed senders `NotesProfiles`,
/// `NotesSingle` and `NotesMulti`. `primary_profile: None` omits the
/// `primary`, `secondary` and `suppliers` entry points.
#[proc_macro]
pub fn cross_profile_type(input: TokenStream) -> TokenStream {
	let service = parse_macro_input!(input as ServiceInput);

	let vis = &service.vis;
	let name = &service.name;
	let name_str = name.to_string();
	let target = format_ident!("{}Target", name);
	let adapter = format_ident!("{}Adapter", name);
	let profiles = format_ident!("{}Profiles", name);
	let single = format_ident!("{}Single", name);
	let multi = format_ident!("{}Multi", name);

	let connector = service.connector.as_ref().map(|lit| quote! { .connector(#lit) });
	let policy = service.policy.as_ref().map(|policy| quote! { .policy(::xprofile::UncaughtExceptionPolicy::#policy) });
	let method_descriptors = service.methods.iter().map(MethodDecl::descriptor);
	let target_methods = service.methods.iter().map(MethodDecl::target_signature);
	let adapter_arms = service.methods.iter().map(|method| method.adapter_arm(&name_str));
	let single_methods = service.methods.iter().map(MethodDecl::single_method);
	let multi_methods = service.methods.iter().map(MethodDecl::multi_method);

	let primary_profile = match service.primary_profile {
		Some(PrimaryProfile::Personal) => quote! { ::xprofile::ProfileType::Personal },
		Some(PrimaryProfile::Work) => quote! { ::xprofile::ProfileType::Work },
		Some(PrimaryProfile::None) => quote! { ::xprofile::ProfileType::None },
		None => quote! { ::std::option::Option::None::<::xprofile::ProfileType> },
	};
	let declared_primary = match service.primary_profile {
		Some(_) => quote! { ::std::option::Option::Some(#primary_profile) },
		None => primary_profile,
	};

	let role_entry_points = (service.primary_profile != Some(PrimaryProfile::None)).then(|| {
		quote! {
			pub fn primary(&self) -> #single {
				#single { sender: self.surface.primary() }
			}

			pub fn secondary(&self) -> #single {
				#single { sender: self.surface.secondary() }
			}

			pub fn suppliers(&self) -> #multi {
				#multi { sender: self.surface.suppliers() }
			}
		}
	});

	let span = Span::call_site();
	let unknown = LitStr::new(&format!("{name_str} has no method '{{}}'"), span);

	TokenStream::from(quote! {
		#vis struct #name;

		impl #name {
			pub const NAME: &'static str = #name_str;

			/// Primary profile declared with the service, if any.
			pub const PRIMARY_PROFILE: ::std::option::Option<::xprofile::ProfileType> = #declared_primary;

			pub fn descriptor() -> ::xprofile::Result<::xprofile::CrossProfileType> {
				::xprofile::CrossProfileType::builder(#name_str)
					#connector
					#policy
					#(.method(#method_descriptors))*
					.build()
			}

			pub fn create(connector: ::xprofile::ProfileConnector) -> ::xprofile::Result<#profiles> {
				Self::check_connector(&connector)?;
				::xprofile::ServiceSurface::create(Self::descriptor()?, connector).map(#profiles::from_surface)
			}

			pub fn create_with_local<T: #target + 'static>(connector: ::xprofile::ProfileConnector, local: T) -> ::xprofile::Result<#profiles> {
				Self::check_connector(&connector)?;
				::xprofile::ServiceSurface::create_with_local(Self::descriptor()?, connector, Self::adapter(local)).map(#profiles::from_surface)
			}

			/// Rejects a connector whose primary profile differs from the declared one.
			pub fn check_connector(connector: &::xprofile::ProfileConnector) -> ::xprofile::Result<()> {
				let configured = connector.config().primary_profile;
				match Self::PRIMARY_PROFILE {
					::std::option::Option::Some(declared) if declared != configured => {
						::std::result::Result::Err(::xprofile::Error::InvalidDescriptor(format!(
							"{} declares primary profile {:?} but connector '{}' is configured with {:?}",
							#name_str,
							declared,
							connector.config().name,
							configured
						)))
					}
					_ => ::std::result::Result::Ok(()),
				}
			}

			pub fn adapter<T: #target + 'static>(target: T) -> ::std::sync::Arc<dyn ::xprofile::ServiceImpl> {
				::std::sync::Arc::new(#adapter(target))
			}
		}

		#[::xprofile::async_trait]
		#vis trait #target: Send + Sync {
			#(#target_methods;)*
		}

		#vis struct #adapter<T>(pub T);

		#[::xprofile::async_trait]
		impl<T: #target> ::xprofile::ServiceImpl for #adapter<T> {
			#[allow(unused_mut, unused_variables, clippy::let_unit_value)]
			async fn invoke(
				&self,
				method: &str,
				args: ::std::vec::Vec<::xprofile::Value>,
				callbacks: ::std::vec::Vec<::xprofile::CallbackHandle>,
			) -> ::std::result::Result<::xprofile::Value, ::xprofile::MethodFailure> {
				let mut callbacks = callbacks.into_iter();
				match method {
					#(#adapter_arms)*
					other => Err(::xprofile::MethodFailure::new("UnknownMethod", format!(#unknown, other))),
				}
			}
		}

		#[derive(Clone)]
		#vis struct #profiles {
			surface: ::xprofile::ServiceSurface,
		}

		impl #profiles {
			pub fn from_surface(surface: ::xprofile::ServiceSurface) -> Self {
				Self { surface }
			}

			pub fn surface(&self) -> &::xprofile::ServiceSurface {
				&self.surface
			}

			pub fn current(&self) -> #single {
				#single { sender: self.surface.current() }
			}

			pub fn other(&self) -> #single {
				#single { sender: self.surface.other() }
			}

			pub fn personal(&self) -> #single {
				#single { sender: self.surface.personal() }
			}

			pub fn work(&self) -> #single {
				#single { sender: self.surface.work() }
			}

			pub fn profile(&self, profile: ::xprofile::Profile) -> #single {
				#single { sender: self.surface.profile(profile) }
			}

			pub fn profiles(&self, profiles: impl ::std::iter::IntoIterator<Item = ::xprofile::Profile>) -> #multi {
				#multi { sender: self.surface.profiles(profiles) }
			}

			pub fn both(&self) -> #multi {
				#multi { sender: self.surface.both() }
			}

			#role_entry_points

			pub fn on_uncaught_failure<F>(&self, listener: F)
			where
				F: Fn(&::xprofile::ProfileRuntimeException) + Send + Sync + 'static,
			{
				self.surface.on_uncaught_failure(listener);
			}

			pub fn clear_cache(&self) {
				self.surface.clear_cache();
			}
		}

		#[derive(Clone)]
		#vis struct #single {
			sender: ::xprofile::SingleSender,
		}

		impl #single {
			pub fn untyped(&self) -> &::xprofile::SingleSender {
				&self.sender
			}

			pub fn target(&self) -> ::xprofile::Result<::xprofile::Profile> {
				self.sender.target()
			}

			#(#single_methods)*
		}

		#[derive(Clone)]
		#vis struct #multi {
			sender: ::xprofile::MultiSender,
		}

		impl #multi {
			pub fn untyped(&self) -> &::xprofile::MultiSender {
				&self.sender
			}

			pub fn only_connected(self) -> Self {
				Self { sender: self.sender.only_connected() }
			}

			#(#multi_methods)*
		}
	})
}
