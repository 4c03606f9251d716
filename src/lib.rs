//! Rootless, cross-architecture builder for Arch Linux and its ports.
//!
//! Produces bootable disk images and root filesystem archives from a
//! declarative build description, without requiring root on the host:
//!
//! - **cache** - lazy content-addressed store for repo indices, packages
//!   and keyring backups
//! - **pacman** - loose/strict package manager configuration and wrappers
//! - **table** - sfdisk-style partition table model
//! - **nspawn** - user-namespace orchestration and the chroot-building
//!   child
//! - **keyring** - bootstrap and deterministic keyring caching
//! - **setup** - initrd, packages, fstab, bootloader, hostname, locales
//! - **emit** - tarball, partition image and disk image emission
//!
//! The same binary is both halves of a build: the parent configures and
//! prepares, then re-invokes itself as the child inside new user, pid and
//! mount namespaces where an unprivileged caller appears as uid 0.

pub mod cache;
pub mod cli;
pub mod context;
pub mod emit;
pub mod keyring;
pub mod logging;
pub mod nspawn;
pub mod pacman;
pub mod preflight;
pub mod process;
pub mod setup;
pub mod table;

pub use context::{BuildContext, BuildContextBuilder};
