use crate::cache::Cache;
use crate::cli::CommandLineArgs;
use crate::limits::Limits;
use crate::resource_manager::ResourceManager;
use crate::s3_client::{S3Client, S3Credentials};
use crate::store::{ObjectStore, S3ObjectStore};

use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Size ceilings and defaults.
    pub limits: Limits,

    /// Tiered result cache.
    pub cache: Cache,

    /// Storage holding the HDF5 files.
    pub store: Arc<dyn ObjectStore>,

    /// Resource manager.
    pub resource_manager: ResourceManager,
}

impl AppState {
    /// Create and return an [AppState] reading from the configured S3 bucket.
    pub fn new(args: &CommandLineArgs) -> Self {
        let resource_manager = ResourceManager::new(args.connection_limit_s3, args.task_limit);
        let credentials = S3Credentials::from_optional(
            args.s3_access_key.as_deref(),
            args.s3_secret_key.as_deref(),
        );
        let client = S3Client::new(&args.s3_endpoint, credentials);
        let store = S3ObjectStore::new(
            client,
            &args.s3_bucket,
            args.max_object_size,
            args.block_options(),
            args.cache_files,
        )
        .with_connection_limit(resource_manager.s3_connection_limiter());
        Self::build(args, Arc::new(store), resource_manager)
    }

    /// Create and return an [AppState] reading from `store`.
    pub fn with_store(args: &CommandLineArgs, store: Arc<dyn ObjectStore>) -> Self {
        let resource_manager = ResourceManager::new(args.connection_limit_s3, args.task_limit);
        Self::build(args, store, resource_manager)
    }

    fn build(
        args: &CommandLineArgs,
        store: Arc<dyn ObjectStore>,
        resource_manager: ResourceManager,
    ) -> Self {
        Self {
            args: args.clone(),
            limits: args.limits(),
            cache: Cache::new(args.cache_capacities()),
            store,
            resource_manager,
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
