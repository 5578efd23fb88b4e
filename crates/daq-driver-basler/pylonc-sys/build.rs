use std::env;
use std::path::PathBuf;

fn main() {
    // Only run bindgen and linking logic if the `pylon-sdk` feature is enabled.
    // Without it the crate compiles to an empty module.
    #[cfg(feature = "pylon-sdk")]
    {
        println!("cargo:rerun-if-env-changed=PYLON_ROOT");
        println!("cargo:rerun-if-env-changed=PYLON_LIB_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let pylon_root = env::var("PYLON_ROOT").expect(
            "PYLON_ROOT environment variable must be set when `pylon-sdk` feature is enabled.",
        );

        let include_path = PathBuf::from(&pylon_root).join("include");

        // PYLON_LIB_DIR overrides the default lib path
        let lib_path = if let Ok(lib_dir) = env::var("PYLON_LIB_DIR") {
            PathBuf::from(lib_dir)
        } else if cfg!(target_os = "windows") {
            PathBuf::from(&pylon_root).join("lib").join("x64")
        } else {
            PathBuf::from(&pylon_root).join("lib")
        };

        if !include_path.exists() {
            panic!("pylon include path does not exist: {:?}", include_path);
        }
        if !lib_path.exists() {
            eprintln!("Warning: pylon lib path does not exist: {:?}", lib_path);
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", include_path.display()))
            // Pylon* device, stream grabber and wait object functions
            .allowlist_function("Pylon.*")
            // GenApiGetLastErrorMessage and friends
            .allowlist_function("GenApi.*")
            .allowlist_type("PYLON_.*")
            .allowlist_type("PylonGrabResult_t")
            .allowlist_type("EPylon.*")
            .allowlist_type("GENAPIC_RESULT")
            .allowlist_var("PYLONC_ACCESS_MODE_.*")
            .allowlist_var("PYLON_WAITOBJECT_.*")
            .rustified_enum("EPylonGrabStatus")
            .rustified_enum("EPylonPayloadType")
            .generate()
            .expect("Unable to generate pylon bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", lib_path.display());

        #[cfg(target_os = "windows")]
        {
            println!("cargo:rustc-link-lib=PylonC");
        }
        #[cfg(target_os = "macos")]
        {
            println!("cargo:rustc-link-search=framework=/Library/Frameworks");
            println!("cargo:rustc-link-lib=framework=pylon");
        }
        #[cfg(target_os = "linux")]
        {
            println!("cargo:rustc-link-lib=pylonc");
        }
    }
    #[cfg(not(feature = "pylon-sdk"))]
    {
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when pylon-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
