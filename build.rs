//! Build script for vdi-relay
//!
//! With the `mpi` feature enabled this script:
//! 1. Finds the MPI installation via pkg-config or mpicc
//! 2. Compiles the C wrapper (vdirelay.c)
//! 3. Links against the MPI library
//!
//! Without it nothing is compiled and the crate only offers the in-process
//! backend.

use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=csrc/vdirelay.c");
    println!("cargo:rerun-if-changed=csrc/vdirelay.h");
    println!("cargo:rerun-if-env-changed=MPI_PKG_CONFIG");
    println!("cargo:rerun-if-env-changed=MPICC");
    println!("cargo:rerun-if-env-changed=CRAY_MPICH_DIR");

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let mpi_config = find_mpi_config();

    let mut build = cc::Build::new();
    build
        .file("csrc/vdirelay.c")
        .include("csrc")
        .warnings(true)
        .extra_warnings(true);

    for path in &mpi_config.include_paths {
        build.include(path);
    }

    if env::var("PROFILE").unwrap_or_default() == "release" {
        build.opt_level(3);
    }

    build.compile("vdirelay");

    for path in &mpi_config.link_paths {
        println!("cargo:rustc-link-search=native={}", path.display());
        // The JVM loads the cdylib from an arbitrary directory; the rpath keeps
        // it bound to the libmpi it was built against.
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
    }

    for lib in &mpi_config.libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    if let Some(version) = mpi_config.version {
        println!("cargo:rustc-env=VDI_RELAY_MPI_VERSION={version}");
    }
}

struct MpiConfig {
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
    version: Option<String>,
}

fn find_mpi_config() -> MpiConfig {
    // Strategy 1: MPI_PKG_CONFIG names the pkg-config package
    if let Ok(pkg_name) = env::var("MPI_PKG_CONFIG") {
        if let Ok(config) = try_pkg_config(&pkg_name) {
            eprintln!("Found MPI via MPI_PKG_CONFIG={pkg_name}");
            return config;
        }
    }

    // Strategy 2: common pkg-config names
    for pkg_name in &["mpich", "ompi", "ompi-c", "mpi"] {
        if let Ok(config) = try_pkg_config(pkg_name) {
            eprintln!("Found MPI via pkg-config: {pkg_name}");
            return config;
        }
    }

    // Strategy 3: the compiler wrapper, honouring MPICC
    if let Ok(config) = try_mpicc() {
        eprintln!("Found MPI via mpicc");
        return config;
    }

    // Strategy 4: Cray programming environment
    if let Ok(mpich_dir) = env::var("CRAY_MPICH_DIR") {
        eprintln!("Found Cray MPI at {mpich_dir}");
        return MpiConfig {
            include_paths: vec![PathBuf::from(format!("{mpich_dir}/include"))],
            link_paths: vec![PathBuf::from(format!("{mpich_dir}/lib"))],
            libs: vec!["mpi".to_string()],
            version: None,
        };
    }

    // Strategy 5: common installation prefixes, preferring lib64 where present
    for prefix in &["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi", "/usr/lib/x86_64-linux-gnu/openmpi"] {
        let include = PathBuf::from(format!("{prefix}/include"));
        if !include.join("mpi.h").exists() {
            continue;
        }
        let link_paths: Vec<PathBuf> = ["lib64", "lib"]
            .iter()
            .map(|dir| PathBuf::from(format!("{prefix}/{dir}")))
            .filter(|path| path.is_dir())
            .collect();
        eprintln!("Found MPI at {prefix}");
        return MpiConfig {
            include_paths: vec![include],
            link_paths,
            libs: vec!["mpi".to_string()],
            version: None,
        };
    }

    panic!(
        "The `mpi` feature needs an MPI installation. Install MPICH or OpenMPI and either:\n\
         - Set MPI_PKG_CONFIG to the pkg-config name (e.g., 'mpich')\n\
         - Ensure 'mpicc' is in PATH\n\
         - Set CRAY_MPICH_DIR for Cray systems"
    );
}

fn try_pkg_config(name: &str) -> Result<MpiConfig, pkg_config::Error> {
    let lib = pkg_config::Config::new()
        .cargo_metadata(false)
        .probe(name)?;

    Ok(MpiConfig {
        include_paths: lib.include_paths,
        link_paths: lib.link_paths,
        libs: lib.libs,
        version: Some(lib.version),
    })
}

fn try_mpicc() -> Result<MpiConfig, String> {
    let mpicc = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());

    let output = Command::new(&mpicc)
        .arg("-show")
        .output()
        .map_err(|e| format!("Failed to run '{mpicc}': {e}"))?;

    if !output.status.success() {
        return Err("mpicc -show failed".to_string());
    }

    let show_output = String::from_utf8_lossy(&output.stdout);
    parse_mpicc_show(&show_output)
}

#[allow(clippy::unnecessary_wraps)]
fn parse_mpicc_show(output: &str) -> Result<MpiConfig, String> {
    let mut include_paths = Vec::new();
    let mut link_paths = Vec::new();
    let mut libs = Vec::new();

    for part in output.split_whitespace() {
        if let Some(path) = part.strip_prefix("-I") {
            include_paths.push(PathBuf::from(path));
        } else if let Some(path) = part.strip_prefix("-L") {
            link_paths.push(PathBuf::from(path));
        } else if let Some(lib) = part.strip_prefix("-l") {
            libs.push(lib.to_string());
        }
    }

    if libs.is_empty() {
        libs.push("mpi".to_string());
    }

    Ok(MpiConfig {
        include_paths,
        link_paths,
        libs,
        version: None,
    })
}
