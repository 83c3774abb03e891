mod common;

use common::{COLUMNS, ROWS, write_series, write_slice};
use dicom_segmentation::{
    ConversionJob, PipelineError, SortBy, VolumeBuilder, nifti, select_best_series,
};
use std::path::Path;

const AXIAL: &str = "1.2.826.0.1.3680043.2.1125.20";
const SCOUT: &str = "1.2.826.0.1.3680043.2.1125.10";

fn job(source: &Path, output: &Path) -> ConversionJob {
    ConversionJob {
        source_directory: source.to_path_buf(),
        output_directory: output.to_path_buf(),
        sort_by: SortBy::default(),
        builder: VolumeBuilder::default(),
    }
}

#[test]
fn converted_volume_has_one_slice_per_file() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_series(source.path(), "ct", AXIAL, 5);
    write_series(source.path(), "scout", SCOUT, 1);

    let mut logs = Vec::new();
    let path = job(source.path(), output.path())
        .run(&mut |line| logs.push(line))
        .unwrap();

    assert!(path.is_absolute());
    assert_eq!(path, std::path::absolute(output.path().join("ct.nii.gz")).unwrap());

    let header = nifti::read_header(&path).unwrap();
    assert_eq!(header.slice_count(), 5);
    assert_eq!(header.dim, [usize::from(COLUMNS), usize::from(ROWS), 5]);
    assert_eq!(header.pixdim, [0.75, 0.5, 2.0]);

    assert_eq!(logs.first().unwrap(), "Reading DICOM folder...");
    assert_eq!(logs.last().unwrap(), &format!("NIfTI created: {}", path.display()));
}

#[test]
fn voxel_data_follows_slice_order() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    // Names sort opposite to position; fill value marks the position.
    for (name, z, fill) in [("a.dcm", 4.0, 2), ("b.dcm", 2.0, 1), ("c.dcm", 0.0, 0)] {
        write_slice(&source.path().join(name), AXIAL, 1, z, fill);
    }

    let path = job(source.path(), output.path()).run(&mut |_| {}).unwrap();
    let (header, data) = nifti::read_volume(&path).unwrap();

    assert_eq!(header.slice_count(), 3);
    for slice in 0..3 {
        assert!(data.index_axis(ndarray::Axis(0), slice).iter().all(|v| *v == slice as f32));
    }
    // Origin in RAS: x and y are flipped from LPS.
    assert_eq!(header.srow[0][3], 10.0);
    assert_eq!(header.srow[1][3], -20.0);
    assert_eq!(header.srow[2][3], 0.0);
}

#[test]
fn reconversion_overwrites_single_volume_file() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_series(source.path(), "ct", AXIAL, 3);

    let first = job(source.path(), output.path()).run(&mut |_| {}).unwrap();
    let second = job(source.path(), output.path()).run(&mut |_| {}).unwrap();

    assert_eq!(first, second);
    let entries: Vec<_> = std::fs::read_dir(output.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("ct.nii.gz")]);
}

#[test]
fn output_directory_is_created() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let nested = output.path().join("case-001").join("nifti");
    write_series(source.path(), "ct", AXIAL, 2);

    let path = job(source.path(), &nested).run(&mut |_| {}).unwrap();
    assert!(path.starts_with(std::path::absolute(&nested).unwrap()));
}

#[test]
fn empty_source_produces_no_volume() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let err = job(source.path(), output.path()).run(&mut |_| {}).unwrap_err();

    assert!(matches!(err, PipelineError::NoSeriesFound { .. }));
    assert!(!output.path().join("ct.nii.gz").exists());
}

#[test]
fn undecodable_slice_fails_the_build() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_series(source.path(), "ct", AXIAL, 2);
    std::fs::write(source.path().join("ct_999.dcm"), b"not really dicom").unwrap();
    let descriptor = select_best_series(source.path(), SortBy::default()).unwrap();
    let mut files = descriptor.files.clone();
    files.push(source.path().join("ct_999.dcm"));
    let broken = dicom_segmentation::SeriesDescriptor { files, ..descriptor };

    let err = VolumeBuilder::default()
        .build_volume(&broken, output.path(), &mut |_| {})
        .unwrap_err();

    assert!(matches!(err, PipelineError::VolumeBuild(_)));
    assert!(!output.path().join("ct.nii.gz").exists());
}

#[test]
fn output_path_occupied_by_file_is_a_build_error() {
    let source = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    write_series(source.path(), "ct", AXIAL, 2);
    let occupied = scratch.path().join("out");
    std::fs::write(&occupied, b"not a folder").unwrap();

    let err = job(source.path(), &occupied).run(&mut |_| {}).unwrap_err();

    match err {
        PipelineError::VolumeBuild(message) => {
            assert!(message.contains(&occupied.display().to_string()), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn missing_source_folder_is_a_build_error() {
    let scratch = tempfile::tempdir().unwrap();
    let missing = scratch.path().join("no-such-study");
    let output = scratch.path().join("out");

    let err = job(&missing, &output).run(&mut |_| {}).unwrap_err();

    match err {
        PipelineError::VolumeBuild(message) => {
            assert!(message.contains("no-such-study"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!output.join("ct.nii.gz").exists());
}
