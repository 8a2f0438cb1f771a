use proc_macro::{TokenStream, TokenTree};

/// Turns `fn main() { .. }` into the program entry point. Returning from `main` exits with
/// status zero.
#[proc_macro_attribute]
pub fn main(_args: TokenStream, input: TokenStream) -> TokenStream {
    let mut iter = input.into_iter();

    if let Err(e) = check_next_ident(&mut iter, "fn").and_then(|()| check_next_ident(&mut iter, "main")) {
        return e;
    }

    let body: TokenStream = iter.collect();
    let mut out: TokenStream = "
        #[no_mangle]
        pub extern \"C\" fn _start() -> ! {
            __main();
            ::libsable::syscall::exit(0)
        }

        #[inline(always)]
        fn __main
    "
    .parse()
    .unwrap();

    out.extend(body);
    out
}

fn check_next_ident(iter: &mut impl Iterator<Item = TokenTree>, expected: &str) -> Result<(), TokenStream> {
    match iter.next() {
        Some(TokenTree::Ident(ident)) if ident.to_string() == expected => Ok(()),
        _ => Err("compile_error!(\"expected `fn main`\");".parse().unwrap()),
    }
}
