use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse2, parse_quote, Expr, GenericArgument, ItemFn, Lit, LitFloat, LitStr, PathArguments,
    Result, ReturnType, Type,
};

fn timer_path() -> TokenStream {
    quote!(::coalescer::utils::timer)
}

pub fn timeout(attr: TokenStream, item: TokenStream) -> Result<TokenStream> {
    let attr: TimeoutArgs = parse2(attr)?;
    let mut func: ItemFn = parse2(item)?;

    let timer = timer_path();
    let duration = attr.into_duration_expr()?;
    let block = &func.block;
    let run = if func.sig.asyncness.is_some() {
        quote!(#timer::with_timeout_async(async move #block, __duration).await)
    } else {
        quote!(#timer::with_timeout(move || #block, __duration))
    };
    let on_timeout = if result_output(&func.sig.output).is_some() {
        quote!(return ::core::result::Result::Err(::core::convert::Into::into(err)))
    } else {
        quote!({
            let _ = err;
            panic!("timeout")
        })
    };
    let body = quote!({
        let __duration = #timer::helpers::IntoTimeoutDuration::into_timeout_duration(#duration);
        match #run {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(err) => #on_timeout,
        }
    });

    func.block = Box::new(parse_quote!(#body));
    Ok(quote!(#func))
}

pub fn should_timeout(attr: TokenStream, item: TokenStream) -> Result<TokenStream> {
    let attr: TimeoutArgs = parse2(attr)?;
    let mut func: ItemFn = parse2(item)?;

    let output = &func.sig.output;
    let result = result_output(output);
    let returns_unit = match result {
        Some((ok, _)) => is_unit_type(ok),
        None => match output {
            ReturnType::Default => true,
            ReturnType::Type(_, ty) => is_unit_type(ty),
        },
    };
    if !returns_unit {
        bail!(
            Span::call_site(),
            "should_timeout only supports functions returning () or Result<(), E>"
        );
    }
    let is_result = result.is_some();

    let timer = timer_path();
    let duration = attr.into_duration_expr()?;
    let block = &func.block;
    let run = match (func.sig.asyncness.is_some(), is_result) {
        (true, true) => quote!(
            #timer::helpers::with_should_timeout_async(
                async move {
                    let _ = (async move #block).await;
                },
                __duration,
            )
            .await
        ),
        (true, false) => {
            quote!(#timer::helpers::with_should_timeout_async(async move #block, __duration).await)
        }
        (false, true) => quote!(
            #timer::helpers::with_should_timeout(
                move || {
                    let _ = #block;
                },
                __duration,
            )
        ),
        (false, false) => {
            quote!(#timer::helpers::with_should_timeout(move || #block, __duration))
        }
    };
    let (on_timeout, on_finished) = if is_result {
        (
            quote!(::core::result::Result::Ok(())),
            quote!(return ::core::result::Result::Err(::core::convert::Into::into(err))),
        )
    } else {
        (
            quote!(()),
            quote!({
                let _ = err;
                panic!("should timeout")
            }),
        )
    };
    let body = quote!({
        let __duration = #timer::helpers::IntoTimeoutDuration::into_timeout_duration(#duration);
        match #run {
            ::core::result::Result::Ok(()) => #on_timeout,
            ::core::result::Result::Err(err) => #on_finished,
        }
    });

    func.block = Box::new(parse_quote!(#body));
    Ok(quote!(#func))
}

struct TimeoutArgs {
    duration: Expr,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.is_empty() {
            bail!(Span::call_site(), "timeout duration is required");
        }
        let duration: Expr = input.parse()?;
        if !input.is_empty() {
            bail!(Span::call_site(), "expected a single duration expression");
        }
        Ok(Self { duration })
    }
}

impl TimeoutArgs {
    fn into_duration_expr(self) -> Result<TokenStream> {
        match self.duration {
            Expr::Lit(expr_lit) => match &expr_lit.lit {
                Lit::Str(lit) => duration_from_literal(lit),
                _ => Ok(quote!(#expr_lit)),
            },
            expr => Ok(quote!(#expr)),
        }
    }
}

fn result_output(output: &ReturnType) -> Option<(&Type, &Type)> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Path(type_path) = ty.as_ref() else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    let types: Vec<&Type> = args
        .args
        .iter()
        .map(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty),
            _ => None,
        })
        .collect::<Option<_>>()?;
    match types[..] {
        [ok, err] => Some((ok, err)),
        _ => None,
    }
}

fn is_unit_type(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

// Checked here so that a bad literal is a compile error instead of a test-time panic.
fn duration_from_literal(lit: &LitStr) -> Result<TokenStream> {
    let raw = lit.value();
    let s = raw.trim();
    if s.is_empty() {
        bail!(lit.span(), "duration literal is empty");
    }
    let (number, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, Unit::Millis)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Unit::Secs)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, Unit::Mins)
    } else {
        bail!(lit.span(), "invalid duration literal");
    };
    if number.is_empty() {
        bail!(lit.span(), "invalid duration literal");
    }
    let value: f64 = number
        .parse()
        .map_err(|_| syn::Error::new(lit.span(), "invalid duration number"))?;
    if !value.is_finite() || value < 0.0 {
        bail!(lit.span(), "duration must be non-negative and finite");
    }

    let mut secs = format!("{}", unit.to_secs(value));
    if !secs.contains(['.', 'e', 'E']) {
        secs.push_str(".0");
    }
    let secs = LitFloat::new(&secs, lit.span());
    Ok(quote!(::std::time::Duration::from_secs_f64(#secs)))
}

#[derive(Clone, Copy)]
enum Unit {
    Millis,
    Secs,
    Mins,
}
impl Unit {
    fn to_secs(self, value: f64) -> f64 {
        match self {
            Unit::Millis => value / 1000.0,
            Unit::Secs => value,
            Unit::Mins => value * 60.0,
        }
    }
}
