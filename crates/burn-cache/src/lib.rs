mod acl;
mod acquire;
mod cache;
mod layout;
mod retry;

pub use acl::{reset_inherited_acl, secure_cache_root};
pub use acquire::{acquire_from_source, extract_container, Downloader, HttpDownloader, ProgressFn};
pub use cache::{transfer_file, PackageCache};
pub use layout::{relative_payload_path, CacheLayout};
pub use retry::{is_verification_failure, RetryPolicy};

#[cfg(test)]
mod tests;
