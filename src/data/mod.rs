//! # Typed containers of the assimilation spaces
//!
//! One submodule per space of the variational chain:
//!
//! - [`domain`] — the shape authority ([`domain::DomainRecord`]) and coordinate types.
//! - [`physical`] — the interpretable control vector and its prior covariance factors.
//! - [`unknown`] — the whitened vector handed to the minimizer.
//! - [`model_io`] — file-backed model input/output, adjoint forcing and sensitivity handles.
//! - [`observation`] — sparse observation records and the canonical observation file.
//!
//! Containers are immutable value objects; transforms produce new instances. Every
//! container provides `archive`/`from_file` (self-describing files, see [`crate::archive`])
//! and an `example()` constructor used by the adjoint-consistency test suites.

pub mod domain;
pub mod model_io;
pub mod observation;
pub mod physical;
pub mod unknown;
