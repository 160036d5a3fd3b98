use std::env;

/// Build metadata printed by `clipstash --verbose`
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    for var in ["TARGET", "PROFILE"] {
        let value = env::var(var).unwrap_or_else(|_| "unknown".to_string());
        println!("cargo:rustc-env={}={}", var, value);
    }

    let build_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", build_date);
}
