pub use ferry_core::*;

#[cfg(feature = "storage")]
pub mod storage {
    pub use ferry_storage::*;
}

#[cfg(feature = "client")]
pub mod client {
    pub use ferry_client::*;
}

#[cfg(feature = "packages")]
pub mod packages {
    pub use ferry_packages::*;
}

#[cfg(feature = "fs")]
pub mod fs {
    pub use ferry_fs::*;
}

pub mod prelude {
    pub use ferry_core::prelude::*;

    #[cfg(feature = "storage")]
    pub use ferry_storage::{LocalStorage, ReadStream, WriteStream};

    #[cfg(feature = "client")]
    pub use ferry_client::{BaseUrlResolver, Downloader, JobHandle, JobStatus};

    #[cfg(feature = "packages")]
    pub use ferry_packages::prelude::*;

    #[cfg(feature = "fs")]
    pub use ferry_fs::OsFileSystem;
}
