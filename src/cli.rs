//! Command Line Interface (CLI) arguments.

use crate::cache::CacheCapacities;
use crate::limits::Limits;
use crate::range_reader::BlockOptions;

use byte_unit::Byte;
use clap::Parser;
use url::Url;

/// h5lens command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "H5LENS_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "H5LENS_PORT")]
    pub port: u16,
    /// Maximum time in seconds to wait for requests to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "H5LENS_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Object storage API URL
    #[arg(long, default_value = "http://localhost:9000", env = "H5LENS_S3_ENDPOINT")]
    pub s3_endpoint: Url,
    /// Bucket holding the HDF5 files
    #[arg(long, default_value = "h5lens", env = "H5LENS_S3_BUCKET")]
    pub s3_bucket: String,
    /// Object storage access key
    #[arg(long, env = "H5LENS_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,
    /// Object storage secret key
    #[arg(long, env = "H5LENS_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,
    /// Maximum number of concurrent S3 connections
    #[arg(long, env = "H5LENS_S3_CONNECTION_LIMIT")]
    pub connection_limit_s3: Option<usize>,
    /// Maximum number of concurrent blocking extraction tasks
    #[arg(long, env = "H5LENS_TASK_LIMIT")]
    pub task_limit: Option<usize>,
    /// Largest object that may be fetched, e.g. `4 GiB`
    #[arg(long, default_value = "4 GiB", value_parser = parse_byte_size, env = "H5LENS_MAX_OBJECT_SIZE")]
    pub max_object_size: u64,
    /// Capacity of the group listing cache tier
    #[arg(long, default_value_t = 1024, env = "H5LENS_CACHE_CHILDREN")]
    pub cache_children: usize,
    /// Capacity of the node metadata cache tier
    #[arg(long, default_value_t = 1024, env = "H5LENS_CACHE_METADATA")]
    pub cache_metadata: usize,
    /// Capacity of the dataset shape and type cache tier
    #[arg(long, default_value_t = 4096, env = "H5LENS_CACHE_DATASET")]
    pub cache_dataset: usize,
    /// Capacity of the preview cache tier
    #[arg(long, default_value_t = 512, env = "H5LENS_CACHE_PREVIEW")]
    pub cache_preview: usize,
    /// Capacity of the matrix, line and heatmap cache tier
    #[arg(long, default_value_t = 256, env = "H5LENS_CACHE_DATA")]
    pub cache_data: usize,
    /// Size of the blocks fetched from an object and cached, e.g. `64 KiB`
    #[arg(long, default_value = "64 KiB", value_parser = parse_byte_size, env = "H5LENS_READ_BLOCK_SIZE")]
    pub read_block_size: u64,
    /// Blocks cached per opened object
    #[arg(long, default_value_t = 256, env = "H5LENS_READ_CACHE_BLOCKS")]
    pub read_cache_blocks: usize,
    /// Opened files kept for reuse
    #[arg(long, default_value_t = 16, env = "H5LENS_CACHE_FILES")]
    pub cache_files: usize,
    /// Log filter directives, e.g. `h5lens=info,tower_http=warn`. Defaults to `RUST_LOG`.
    #[arg(long, value_parser = parse_log_filter, env = "H5LENS_LOG")]
    pub log_filter: Option<String>,
}

impl CommandLineArgs {
    pub fn cache_capacities(&self) -> CacheCapacities {
        CacheCapacities {
            children: self.cache_children,
            metadata: self.cache_metadata,
            dataset: self.cache_dataset,
            preview: self.cache_preview,
            data: self.cache_data,
        }
    }

    pub fn block_options(&self) -> BlockOptions {
        BlockOptions {
            block_size: self.read_block_size,
            capacity: self.read_cache_blocks,
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_object_bytes: self.max_object_size,
            ..Limits::default()
        }
    }
}

/// Parse a human readable size such as `512 MiB` into bytes.
fn parse_byte_size(value: &str) -> Result<u64, String> {
    Byte::parse_str(value, true)
        .map(|byte| byte.as_u64())
        .map_err(|err| err.to_string())
}

/// Check that `value` holds valid tracing filter directives.
fn parse_log_filter(value: &str) -> Result<String, String> {
    tracing_subscriber::EnvFilter::try_new(value)
        .map(|_| value.to_string())
        .map_err(|err| err.to_string())
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
