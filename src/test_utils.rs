use crate::app_state::{AppState, SharedAppState};
use crate::array::{Block, Complex};
use crate::cli::CommandLineArgs;
use crate::dataset::MemoryContainer;
use crate::models::*;
use crate::store::MemoryObjectStore;

use clap::Parser;
use ndarray::{arr0, Array, ArrayD, IxDyn};
use std::sync::Arc;

/// Create an integer block of the given shape counting up from zero.
pub(crate) fn iota(shape: &[usize]) -> Block {
    let len = shape.iter().product::<usize>();
    Block::Int(ArrayD::from_shape_vec(IxDyn(shape), (0..len as i64).collect()).unwrap())
}

/// Create a float block of the given shape counting up from zero.
pub(crate) fn float_iota(shape: &[usize]) -> Block {
    let len = shape.iter().product::<usize>();
    Block::Float(
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f64).collect()).unwrap(),
    )
}

/// Create a container with a single float dataset at `/data`.
pub(crate) fn float_container(shape: &[usize]) -> MemoryContainer {
    MemoryContainer::new().with_dataset("/data", DType::float(8), float_iota(shape))
}

/// Create a container exercising each kind of node and dtype.
///
/// ```text
/// /grid/chunked   int32 (30, 40), chunked and compressed, with a `units` attribute
/// /grid/complex   complex128 (2, 2)
/// /grid/cube      float64 (4, 100, 100), element (a, b, c) = 10000a + 100b + c
/// /grid/labels    |S8 (3,)
/// /grid/records   compound (10,)
/// /scalar         float64 ()
/// /series         float64 (5000,)
/// ```
pub(crate) fn sample_container() -> MemoryContainer {
    let cube = Array::from_shape_fn(IxDyn(&[4, 100, 100]), |index| {
        (index[0] * 10_000 + index[1] * 100 + index[2]) as f64
    });
    let series = Array::from_shape_fn(IxDyn(&[5000]), |index| (index[0] as f64 / 100.0).sin());
    let labels = Array::from_shape_vec(
        IxDyn(&[3]),
        vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()],
    )
    .unwrap();
    let complex = Array::from_shape_vec(
        IxDyn(&[2, 2]),
        vec![
            Complex::new(1.0, 2.0),
            Complex::new(0.0, -1.0),
            Complex::new(f64::NAN, 0.0),
            Complex::new(3.5, 0.5),
        ],
    )
    .unwrap();
    let records = Array::from_elem(IxDyn(&[10]), vec![0_u8; 12]);
    let layout = DatasetLayout {
        chunks: Some(vec![10, 10]),
        filters: vec![
            FilterInfo {
                id: 2,
                name: "shuffle".to_string(),
                level: None,
            },
            FilterInfo {
                id: 1,
                name: "gzip".to_string(),
                level: Some(4),
            },
        ],
    };
    MemoryContainer::new()
        .with_layout(
            "/grid/chunked",
            DType::integer(4, true),
            iota(&[30, 40]),
            layout,
        )
        .with_attribute(
            "/grid/chunked",
            Attribute {
                name: "units".to_string(),
                dtype: DType::string(0, true),
                value: Block::Text(arr0("kelvin".to_string()).into_dyn()),
            },
        )
        .with_dataset("/grid/complex", DType::complex(16), Block::Complex(complex))
        .with_dataset("/grid/cube", DType::float(8), Block::Float(cube))
        .with_dataset("/grid/labels", DType::string(8, false), Block::Bytes(labels))
        .with_dataset(
            "/grid/records",
            DType::compound(12, vec!["x".to_string(), "y".to_string(), "z".to_string()]),
            Block::Bytes(records),
        )
        .with_dataset(
            "/scalar",
            DType::float(8),
            Block::Float(arr0(2.5).into_dyn()),
        )
        .with_dataset("/series", DType::float(8), Block::Float(series))
}

/// Create application state with default arguments, reading from `store`.
pub(crate) fn test_state(store: Arc<MemoryObjectStore>) -> SharedAppState {
    let args = CommandLineArgs::parse_from(["h5lens"]);
    Arc::new(AppState::with_store(&args, store))
}
