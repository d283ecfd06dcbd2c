//! Container networking: the CNI wire format and the kernel-side plumbing.

pub mod cni;
pub mod namespace;
pub mod veth;
