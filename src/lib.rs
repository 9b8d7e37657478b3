use std::{path::PathBuf, sync::LazyLock};

use clap::Parser;

pub mod api;
pub mod conductor;
pub mod config;
pub mod error;
pub mod executors;
pub mod middleware;
pub mod persistence;
pub mod policy;
pub mod router;
pub mod services;
pub mod state;
pub mod utils;

pub const IS_DEBUG: bool = cfg!(debug_assertions);
pub static IS_DEV: LazyLock<bool> = LazyLock::new(|| std::env::var("CARGO_MANIFEST_DIR").is_ok());

pub static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    format!(
        "v{} by {}\n| profile: {}\n| mode: {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_AUTHORS"),
        if IS_DEBUG { "debug" } else { "release" },
        if *IS_DEV { "dev" } else { "prod" },
    )
});

pub const FIG: &str = r#"
                   //            //
   ___     ___    //   __  __   //___     ___   __  ___   ___
  //  ) ) //  ) ) //   //  / / ((_ ) )   //  ) )  // ) ) //___) )
 //___/ / //  / / //  //  / /   //  / / //  / /  //  /  //
//       ((__( ( // ((___( (   ((___/ / ((__( (  ((__(  ((____
//                    //__/ /       / /
"#;

/// Header for the application
pub static BANNER: LazyLock<String> = LazyLock::new(|| format!("{}\n{}", FIG, *VERSION_INFO));

/// Command line arguments for the application
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Alternative config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
