//! The request pipeline.
//!
//! Every operation resolves the file identity first and looks up its cache tier under a key
//! derived from that identity. On a miss, a cached shape and dtype for the dataset lets limits
//! be checked before the container is opened. The container is then opened and the extraction
//! runs on a blocking task. Its payload is serialised once and the bytes are cached, so repeated
//! requests return identical bytes without touching storage.

use crate::app_state::SharedAppState;
use crate::cache::{CacheKeyBuilder, CacheTier, FileIdentity};
use crate::dataset::{normalize_path, Container};
use crate::error::H5LensError;
use crate::export::CsvExport;
use crate::limits::Limits;
use crate::models::DatasetInfo;
use crate::request::{
    CacheParams, ExportRequest, HeatmapRequest, LineRequest, MatrixRequest, NodeRequest,
    PreviewRequest,
};
use crate::store::ObjectInfo;
use crate::{export, heatmap, line, matrix, preview};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// CSV chunks buffered between the producing task and the response body.
const EXPORT_CHANNEL_CAPACITY: usize = 4;

/// A stream of CSV chunks.
pub type CsvStream = ReceiverStream<Result<Bytes, H5LensError>>;

/// A resolved request target.
struct Target {
    identity: FileIdentity,
    object: ObjectInfo,
    path: String,
}

impl Target {
    fn key(&self, op: &str, params: &[(&str, String)]) -> String {
        CacheKeyBuilder::build_key(&self.identity, &self.path, op, params)
    }

    fn dataset_key(&self) -> String {
        self.key("dataset", &[])
    }
}

/// Resolve the identity of a file.
async fn resolve(state: &SharedAppState, file: &str, path: &str) -> Result<Target, H5LensError> {
    let _conn = state.resource_manager.s3_connection().await?;
    let object = state.store.head(file).await?;
    Ok(Target {
        identity: FileIdentity::new(file, &object.version()),
        object,
        path: normalize_path(path),
    })
}

/// Open the container of a target. The store takes an S3 connection permit per ranged read.
async fn open(state: &SharedAppState, target: &Target) -> Result<Box<dyn Container>, H5LensError> {
    state
        .store
        .open(&target.identity.file, &target.object)
        .await
}

/// Open the container and run `work` against it on a blocking task.
///
/// Dataset shapes reported by `work` are cached for later limit checks.
async fn compute<T, F>(state: &SharedAppState, target: &Target, work: F) -> Result<T, H5LensError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Container, &Limits) -> Result<(T, Option<DatasetInfo>), H5LensError>
        + Send
        + 'static,
{
    let container = open(state, target).await?;
    let _task = state.resource_manager.task().await?;
    let limits = state.limits.clone();
    let (value, dataset) =
        tokio::task::spawn_blocking(move || work(container.as_ref(), &limits)).await??;
    if let Some(dataset) = dataset {
        state.cache.dataset.insert(target.dataset_key(), dataset);
    }
    Ok(value)
}

fn to_bytes<T: Serialize>(payload: &T) -> Result<Bytes, H5LensError> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

/// Serve a payload from `tier`, computing and caching it on a miss.
///
/// `precheck` runs against the cached dataset shape, when known, before storage is touched.
async fn cached<P, F>(
    state: &SharedAppState,
    tier: &CacheTier<Bytes>,
    (file, path): (&str, &str),
    op: &str,
    params: &[(&'static str, String)],
    precheck: P,
    work: F,
) -> Result<Bytes, H5LensError>
where
    P: FnOnce(&DatasetInfo, &Limits) -> Result<(), H5LensError>,
    F: FnOnce(&dyn Container, &Limits, &str) -> Result<(Bytes, Option<DatasetInfo>), H5LensError>
        + Send
        + 'static,
{
    let target = resolve(state, file, path).await?;
    let key = target.key(op, params);
    if let Some(bytes) = tier.get(&key) {
        tracing::debug!("Cache hit for {}", key);
        return Ok(bytes);
    }
    if let Some(dataset) = state.cache.dataset.get(&target.dataset_key()) {
        precheck(&dataset, &state.limits)?;
    }
    let path = target.path.clone();
    let bytes = compute(state, &target, move |container, limits| {
        work(container, limits, &path)
    })
    .await?;
    tier.insert(key, bytes.clone());
    Ok(bytes)
}

fn no_precheck(_: &DatasetInfo, _: &Limits) -> Result<(), H5LensError> {
    Ok(())
}

/// Shape and type of a dataset.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_dataset_info(
    state: &SharedAppState,
    request: &NodeRequest,
) -> Result<DatasetInfo, H5LensError> {
    let target = resolve(state, &request.file, &request.path).await?;
    if let Some(dataset) = state.cache.dataset.get(&target.dataset_key()) {
        return Ok(dataset);
    }
    let path = target.path.clone();
    compute(state, &target, move |container, _| {
        let info = container.dataset(&path)?.info();
        Ok((info.clone(), Some(info)))
    })
    .await
}

/// Direct children of a group, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_children(
    state: &SharedAppState,
    request: &NodeRequest,
) -> Result<Bytes, H5LensError> {
    cached(
        state,
        &state.cache.children,
        (&request.file, &request.path),
        "children",
        &request.cache_params(),
        no_precheck,
        |container, _, path| Ok((to_bytes(&container.children(path)?)?, None)),
    )
    .await
}

/// Metadata of a group or dataset, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_metadata(
    state: &SharedAppState,
    request: &NodeRequest,
) -> Result<Bytes, H5LensError> {
    cached(
        state,
        &state.cache.metadata,
        (&request.file, &request.path),
        "metadata",
        &request.cache_params(),
        no_precheck,
        |container, _, path| Ok((to_bytes(&container.metadata(path)?)?, None)),
    )
    .await
}

/// Preview of a dataset, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_preview(
    state: &SharedAppState,
    request: &PreviewRequest,
) -> Result<Bytes, H5LensError> {
    let owned = request.clone();
    cached(
        state,
        &state.cache.preview,
        (&request.file, &request.path),
        "preview",
        &request.cache_params(),
        no_precheck,
        move |container, limits, path| {
            let handle = container.dataset(path)?;
            let payload = preview::get_preview(handle.as_ref(), &owned, limits)?;
            Ok((to_bytes(&payload)?, Some(handle.info())))
        },
    )
    .await
}

/// Matrix window of a dataset, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_matrix(
    state: &SharedAppState,
    request: &MatrixRequest,
) -> Result<Bytes, H5LensError> {
    let owned = request.clone();
    cached(
        state,
        &state.cache.data,
        (&request.file, &request.path),
        "matrix",
        &request.cache_params(),
        |info, limits| matrix::plan_request(info, request, limits).map(|_| ()),
        move |container, limits, path| {
            let handle = container.dataset(path)?;
            let payload = matrix::get_matrix(handle.as_ref(), &owned, limits)?;
            Ok((to_bytes(&payload)?, Some(handle.info())))
        },
    )
    .await
}

/// Line profile of a dataset, with any compare series, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_line(state: &SharedAppState, request: &LineRequest) -> Result<Bytes, H5LensError> {
    let owned = request.clone();
    cached(
        state,
        &state.cache.data,
        (&request.file, &request.path),
        "line",
        &request.cache_params(),
        |info, limits| line::plan_request(info, request, limits).map(|_| ()),
        move |container, limits, path| {
            let handle = container.dataset(path)?;
            let compare = owned
                .compare
                .iter()
                .map(|other| container.dataset(&normalize_path(other)))
                .collect::<Result<Vec<_>, _>>()?;
            let payload = line::get_line(handle.as_ref(), &compare, &owned, limits)?;
            Ok((to_bytes(&payload)?, Some(handle.info())))
        },
    )
    .await
}

/// Heatmap plane of a dataset, as JSON.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn get_heatmap(
    state: &SharedAppState,
    request: &HeatmapRequest,
) -> Result<Bytes, H5LensError> {
    let owned = request.clone();
    cached(
        state,
        &state.cache.data,
        (&request.file, &request.path),
        "heatmap",
        &request.cache_params(),
        |info, limits| heatmap::plan_request(info, request, limits).map(|_| ()),
        move |container, limits, path| {
            let handle = container.dataset(path)?;
            let payload = heatmap::get_heatmap(handle.as_ref(), &owned, limits)?;
            Ok((to_bytes(&payload)?, Some(handle.info())))
        },
    )
    .await
}

/// Stream a CSV export of a dataset.
///
/// The export is planned before this returns, so request errors are reported up front. Chunks
/// are then produced on a blocking task, which stops at the first failed send once the stream
/// is dropped.
#[tracing::instrument(level = "DEBUG", skip(state))]
pub async fn export_stream(
    state: &SharedAppState,
    request: &ExportRequest,
) -> Result<CsvStream, H5LensError> {
    let target = resolve(state, &request.file, &request.path).await?;
    if let Some(dataset) = state.cache.dataset.get(&target.dataset_key()) {
        export::plan(&dataset, request, &state.limits)?;
    }
    let container = open(state, &target).await?;
    let request = request.clone();
    let path = target.path.clone();
    let limits = state.limits.clone();
    let (container, export, info) = {
        let _task = state.resource_manager.task().await?;
        tokio::task::spawn_blocking(move || {
            let handle = container.dataset(&path)?;
            let info = handle.info();
            let export = CsvExport::from_request(handle, &request, &limits)?;
            Ok::<_, H5LensError>((container, export, info))
        })
        .await??
    };
    state.cache.dataset.insert(target.dataset_key(), info);

    let (tx, rx) = mpsc::channel(EXPORT_CHANNEL_CAPACITY);
    let state = state.clone();
    tokio::spawn(async move {
        let _task = match state.resource_manager.task().await {
            Ok(permit) => permit,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let produced = tokio::task::spawn_blocking(move || {
            let _container = container;
            for chunk in export {
                if tx.blocking_send(chunk).is_err() {
                    tracing::debug!("Export receiver dropped, stopping");
                    break;
                }
            }
        })
        .await;
        if let Err(err) = produced {
            tracing::error!("Export task failed: {}", err);
        }
    });
    Ok(ReceiverStream::new(rx))
}
