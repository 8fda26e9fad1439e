pub type Errno = nix::errno::Errno;

/// Result type alias using nix's Errno for framework operations
pub type Result<T> = std::result::Result<T, Errno>;
