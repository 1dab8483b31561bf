//! `init-cache` stage: prepare per-distribution chroot caches that later
//! build steps reuse instead of bootstrapping from scratch.

pub mod archlinux;
pub mod deb;
pub mod rpm;
