fn main() {
    // Cargo doesn't expose `--cfg feature = "numa"` to build scripts, only
    // the CARGO_FEATURE_* env vars, so the link directive is gated on that
    // instead of `#[cfg(...)]`.
    if std::env::var_os("CARGO_FEATURE_NUMA").is_some() {
        println!("cargo:rustc-link-lib=numa");
    }
}
