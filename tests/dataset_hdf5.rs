mod common;

use anyhow::Result;
use tempfile::TempDir;

use vecbench::dataset::open_dataset;

#[cfg(feature = "hdf5")]
mod enabled {
    use std::path::{Path, PathBuf};

    use ndarray::{Array1, Array2};
    use rstest::*;
    use vecbench::dataset::Batch;

    use super::*;
    use crate::common::*;

    /// 与 npy 测试数据相同内容的 HDF5 文件
    fn write_hdf5_dataset(path: &Path, filters: bool) -> Result<()> {
        let file = hdf5::File::create(path)?;
        let train = Array2::from_shape_fn((TRAIN_ROWS, DIMENSION), |(i, j)| train_row(i)[j]);
        let test = Array2::from_shape_fn((TEST_ROWS, DIMENSION), |(q, j)| test_row(q)[j] as f64);
        let neighbors = Array2::from_shape_fn((TEST_ROWS, DEPTH), |(q, j)| {
            exact_neighbors(&test_row(q), None, DEPTH)[j] as i32
        });
        file.new_dataset_builder().with_data(&train).create("train")?;
        file.new_dataset_builder().with_data(&test).create("test")?;
        file.new_dataset_builder().with_data(&neighbors).create("neighbors")?;
        if filters {
            let train = Array1::from_shape_fn(TRAIN_ROWS, train_category);
            let test = Array1::from_shape_fn(TEST_ROWS, test_category);
            file.new_dataset_builder().with_data(&train).create("train_categories")?;
            file.new_dataset_builder().with_data(&test).create("test_categories")?;
        }
        Ok(())
    }

    #[fixture]
    fn hdf5_file() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.hdf5");
        write_hdf5_dataset(&path, true).unwrap();
        (dir, path)
    }

    #[rstest]
    fn opens_hdf5_file(hdf5_file: (TempDir, PathBuf)) -> Result<()> {
        let (_dir, path) = hdf5_file;
        let dataset = open_dataset(&path, 0, false)?;
        assert_eq!(dataset.train_rows(), TRAIN_ROWS);
        assert_eq!(dataset.dimension(), DIMENSION);
        assert_eq!(dataset.test_vectors()?[3], test_row(3));
        assert_eq!(dataset.neighbors()?[2], exact_neighbors(&test_row(2), None, DEPTH));
        assert!(dataset.train_filters()?.is_empty());
        Ok(())
    }

    #[rstest]
    #[case(7, 0, 0)]
    #[case(3, 5, 11)]
    #[case(50, 0, 0)]
    fn batches_match_npy_backend(
        hdf5_file: (TempDir, PathBuf),
        #[case] batch_size: usize,
        #[case] start: usize,
        #[case] max_rows: usize,
    ) -> Result<()> {
        let (_dir, path) = hdf5_file;
        let npy_dir = tempfile::tempdir()?;
        write_npy_dataset(npy_dir.path(), true)?;

        let read = |path: &Path| -> Result<Vec<Batch>> {
            open_dataset(path, 0, true)?.stream_train(batch_size, start, max_rows)?.collect()
        };
        assert_eq!(read(&path)?, read(npy_dir.path())?);
        Ok(())
    }

    #[test]
    fn filters_require_category_datasets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.h5");
        write_hdf5_dataset(&path, false)?;
        assert!(open_dataset(&path, 0, true).is_err());
        assert!(open_dataset(&path, 0, false).is_ok());
        Ok(())
    }

    #[rstest]
    fn multi_vector_rows(hdf5_file: (TempDir, PathBuf)) -> Result<()> {
        let (_dir, path) = hdf5_file;
        assert_eq!(open_dataset(&path, 2, false)?.dimension(), 2);
        assert!(open_dataset(&path, 3, false).is_err());
        Ok(())
    }
}

#[cfg(not(feature = "hdf5"))]
#[test]
fn hdf5_requires_feature() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("dataset.hdf5");
    std::fs::write(&path, b"")?;
    let err = open_dataset(&path, 0, false).err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("hdf5"), "{}", err);
    Ok(())
}
