#![allow(dead_code)]

use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use dicom_segmentation::{CommandRunner, CommandSpec, PipelineError, PipelineEvent};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub const ROWS: u16 = 4;
pub const COLUMNS: u16 = 3;

fn strs(values: &[String]) -> PrimitiveValue {
    PrimitiveValue::Strs(values.iter().cloned().collect())
}

/// Write one synthetic 16 bit CT slice. Every pixel holds `fill`.
pub fn write_slice(path: &Path, series_uid: &str, instance: i32, z: f64, fill: u16) {
    let sop_uid = format!("{series_uid}.{instance}");
    let mut obj = InMemDicomObject::new_empty();

    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_uid.as_str()),
    ));
    obj.put(DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.826.0.1.3680043.2.1125.1"),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series_uid),
    ));
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(instance.to_string()),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_POSITION_PATIENT,
        VR::DS,
        strs(&["-10".to_string(), "20".to_string(), format!("{z}")]),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_ORIENTATION_PATIENT,
        VR::DS,
        strs(&["1", "0", "0", "0", "1", "0"].map(String::from)),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_SPACING,
        VR::DS,
        strs(&["0.5".to_string(), "0.75".to_string()]),
    ));
    obj.put(DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2")));
    obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1u16)));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(ROWS)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS)));
    obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16u16)));
    obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16u16)));
    obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15u16)));
    obj.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        PrimitiveValue::from(0u16),
    ));

    let pixels = vec![fill; usize::from(ROWS) * usize::from(COLUMNS)];
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::U16(pixels.into()),
    ));

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_uid.as_str()),
        )
        .expect("valid file meta");
    file.write_to_file(path).expect("slice written");
}

/// Write `count` slices of one series as `<prefix>_<i>.dcm`, 2 mm apart.
/// Slice `i` is filled with the value `i`.
pub fn write_series(dir: &Path, prefix: &str, series_uid: &str, count: usize) {
    for i in 0..count {
        write_slice(
            &dir.join(format!("{prefix}_{i:03}.dcm")),
            series_uid,
            i as i32 + 1,
            i as f64 * 2.0,
            i as u16,
        );
    }
}

/// Runner that records commands and replays canned output.
pub struct ScriptedRunner {
    pub lines: Vec<String>,
    pub succeed: bool,
    pub calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(lines: &[&str], succeed: bool) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            succeed,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        _cancel: &CancellationToken,
        on_line: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(spec.clone());
        for line in &self.lines {
            on_line(line.clone());
        }
        if self.succeed {
            Ok(())
        } else {
            Err(PipelineError::ExecutionFailed {
                command: spec.program.clone(),
                reason: "exit code 1".to_string(),
            })
        }
    }
}

pub fn drain(events: &mut UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn log_texts(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Log(line) => Some(line.text.clone()),
            _ => None,
        })
        .collect()
}

/// Runner whose tool prints one line and then runs until cancelled.
pub struct HangingRunner;

pub const HANGING_LINE: &str = "Predicting 1/240";

#[async_trait]
impl CommandRunner for HangingRunner {
    async fn run(
        &self,
        _spec: &CommandSpec,
        cancel: &CancellationToken,
        on_line: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), PipelineError> {
        on_line(HANGING_LINE.to_string());
        cancel.cancelled().await;
        Err(PipelineError::Cancelled)
    }
}
