//! CLI command implementations, one module per subcommand family.
//!
//! Mirrors the teacher's `cmd/` ownership-table convention (each file owns
//! one or more `Commands` variants) narrowed to sequant's six subcommands:
//! `run` owns `Run`, `status` owns `Status`, `maintenance` owns
//! `CleanupOrphans`/`RotateLogs`/`RebuildState`/`Discover`.

pub mod maintenance;
pub mod run;
pub mod status;
