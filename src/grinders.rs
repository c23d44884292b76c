//! Grinder algebra (ported from `dicomnode.lib.grinders`): pure functions
//! that collapse the ordered sequence of Datasets an [`crate::input::Input`]
//! has accumulated into a single user-domain value.
//!
//! Every grinder receives an owned `&[InMemDicomObject]` slice rather than a
//! single-use iterator, which is what lets [`Grinder::Many`] run several
//! sub-grinders over the same data without the re-iteration hazard the
//! Python `many_meta_grinder` relied on `list_grinder` to paper over (see
//! REDESIGN FLAGS in SPEC_FULL.md).

use std::sync::Arc;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_pixeldata::PixelDecoder;
use ndarray::{stack, Array2, Array3, Axis};

use crate::error::{NodeError, Result};
use crate::tree::DicomTree;

/// Float Pixel Data (0x7FE0,0x0008) — not carried by `dicom-dictionary-std`'s
/// name table, so addressed by its group/element pair directly.
const FLOAT_PIXEL_DATA: Tag = Tag(0x7FE0, 0x0008);
/// Double Float Pixel Data (0x7FE0,0x0009).
const DOUBLE_FLOAT_PIXEL_DATA: Tag = Tag(0x7FE0, 0x0009);

/// The ground value produced by a [`Grinder`]: a dynamically-typed slot
/// standing in for the source's bare `Any` return type.
#[derive(Clone)]
pub enum Ground {
    /// Identity grinder: the held Datasets, unmodified, in arrival order.
    Identity(Arc<Vec<InMemDicomObject>>),
    /// List grinder: same payload, named separately so callers can tell
    /// which grinder produced a `Ground::Identity`/`Ground::List` apart.
    List(Vec<InMemDicomObject>),
    /// Tree grinder: the held Datasets re-assembled into a [`DicomTree`].
    Tree(DicomTree),
    /// Numpy grinder: a 3-D pixel stack, one frame per held Dataset, typed
    /// by the source encoding (see [`PixelArray`]).
    Numpy(PixelArray),
    /// Tag grinder: the string rendering of one tag from each Dataset
    /// (`None` where the Dataset lacked the tag).
    Tag(Vec<Option<String>>),
    /// Many combinator: one `Ground` per configured sub-grinder, tee'd over
    /// the same held Datasets.
    Many(Vec<Ground>),
}

/// Declarative grinder configuration; cheap to clone so the same
/// declaration can be shared across every patient's [`crate::input::Input`].
#[derive(Clone)]
pub enum Grinder {
    Identity,
    List,
    Tree,
    Numpy,
    Tag(Tag),
    Many(Vec<Grinder>),
}

impl Grinder {
    pub fn apply(&self, datasets: &[InMemDicomObject]) -> Result<Ground> {
        match self {
            Grinder::Identity => Ok(Ground::Identity(Arc::new(datasets.to_vec()))),
            Grinder::List => Ok(Ground::List(datasets.to_vec())),
            Grinder::Tree => {
                let mut tree = DicomTree::new();
                for dataset in datasets {
                    tree.add(dataset.clone())?;
                }
                Ok(Ground::Tree(tree))
            }
            Grinder::Numpy => Ok(Ground::Numpy(numpy_grind(datasets)?)),
            Grinder::Tag(tag) => Ok(Ground::Tag(
                datasets.iter().map(|ds| element_to_string(ds, *tag)).collect(),
            )),
            Grinder::Many(grinders) => {
                let grounds = grinders
                    .iter()
                    .map(|g| g.apply(datasets))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Ground::Many(grounds))
            }
        }
    }
}

fn element_to_string(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    dataset
        .element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
}

fn required_u16(dataset: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16> {
    dataset
        .element_opt(tag)
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))?
        .ok_or_else(|| NodeError::MissingAttribute(name.to_string()))?
        .to_int::<u16>()
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))
}

/// A 3-D pixel stack (frame, rows, columns), typed by the source's
/// `BitsAllocated`/`PixelRepresentation`/floating-point pixel-data tags
/// rather than uniformly widened.
#[derive(Clone)]
pub enum PixelArray {
    U8(Array3<u8>),
    I16(Array3<i16>),
    U16(Array3<u16>),
    F32(Array3<f32>),
    F64(Array3<f64>),
}

/// The element type a numpy grind produces, chosen from the first Dataset's
/// `BitsAllocated`, `PixelRepresentation`, and the presence of the
/// floating-point pixel-data tags (0x7FE0,0x0008)/(0x7FE0,0x0009).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PixelEncoding {
    U8,
    I16,
    U16,
    F32,
    F64,
}

fn pixel_encoding(bits_allocated: u16, pixel_representation: u16, is_float: bool) -> PixelEncoding {
    if is_float {
        if bits_allocated > 32 {
            PixelEncoding::F64
        } else {
            PixelEncoding::F32
        }
    } else if bits_allocated <= 8 {
        PixelEncoding::U8
    } else if pixel_representation == 1 {
        PixelEncoding::I16
    } else {
        PixelEncoding::U16
    }
}

macro_rules! build_stack {
    ($ty:ty, $datasets:expr) => {{
        let mut frames: Vec<Array2<$ty>> = Vec::with_capacity($datasets.len());
        for dataset in $datasets {
            let rows = required_u16(dataset, tags::ROWS, "Rows")? as usize;
            let columns = required_u16(dataset, tags::COLUMNS, "Columns")? as usize;

            let decoded = dataset
                .decode_pixel_data()
                .map_err(|e| NodeError::invalid_dataset(format!("failed to decode pixel data: {e}")))?;
            let array = decoded
                .to_ndarray::<$ty>()
                .map_err(|e| NodeError::invalid_dataset(format!("failed to build pixel array: {e}")))?;
            // `to_ndarray` may yield a trailing samples-per-pixel axis for
            // monochrome data; reshape against the dataset's own
            // Rows/Columns rather than assume a fixed rank.
            let frame = array
                .into_shape((rows, columns))
                .map_err(|e| NodeError::invalid_dataset(format!("unexpected pixel array shape: {e}")))?;
            frames.push(frame);
        }

        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        stack(Axis(0), &views)
            .map_err(|e| NodeError::invalid_dataset(format!("could not stack pixel frames: {e}")))?
    }};
}

/// Build a 3-D pixel stack (frame, rows, columns) from `datasets`, choosing
/// the in-memory element type from the first Dataset's `BitsAllocated`,
/// `PixelRepresentation`, and floating-point pixel-data tags — later frames
/// are assumed to share the same photometric encoding.
fn numpy_grind(datasets: &[InMemDicomObject]) -> Result<PixelArray> {
    let first = datasets
        .first()
        .ok_or_else(|| NodeError::invalid_dataset("numpy grinder requires at least one dataset"))?;

    let bits_allocated = required_u16(first, tags::BITS_ALLOCATED, "BitsAllocated")?;
    let pixel_representation = required_u16(first, tags::PIXEL_REPRESENTATION, "PixelRepresentation")?;
    let is_float = first.element_opt(FLOAT_PIXEL_DATA).ok().flatten().is_some()
        || first
            .element_opt(DOUBLE_FLOAT_PIXEL_DATA)
            .ok()
            .flatten()
            .is_some();

    match pixel_encoding(bits_allocated, pixel_representation, is_float) {
        PixelEncoding::U8 => Ok(PixelArray::U8(build_stack!(u8, datasets))),
        PixelEncoding::I16 => Ok(PixelArray::I16(build_stack!(i16, datasets))),
        PixelEncoding::U16 => Ok(PixelArray::U16(build_stack!(u16, datasets))),
        PixelEncoding::F32 => Ok(PixelArray::F32(build_stack!(f32, datasets))),
        PixelEncoding::F64 => Ok(PixelArray::F64(build_stack!(f64, datasets))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;

    fn dataset(patient: &str, study: &str, series: &str, instance: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study)),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance)),
        ])
    }

    #[test]
    fn pixel_encoding_follows_bits_allocated_and_representation() {
        assert_eq!(pixel_encoding(8, 0, false), PixelEncoding::U8);
        assert_eq!(pixel_encoding(16, 0, false), PixelEncoding::U16);
        assert_eq!(pixel_encoding(16, 1, false), PixelEncoding::I16);
        assert_eq!(pixel_encoding(32, 0, true), PixelEncoding::F32);
        assert_eq!(pixel_encoding(64, 0, true), PixelEncoding::F64);
    }

    #[test]
    fn identity_and_list_preserve_order() {
        let datasets = vec![
            dataset("P1", "S1", "SE1", "I1"),
            dataset("P1", "S1", "SE1", "I2"),
        ];
        let Ground::List(held) = Grinder::List.apply(&datasets).unwrap() else {
            panic!("expected List");
        };
        assert_eq!(held.len(), 2);
    }

    #[test]
    fn tree_grinder_rebuilds_tree() {
        let datasets = vec![
            dataset("P1", "S1", "SE1", "I1"),
            dataset("P1", "S1", "SE1", "I2"),
        ];
        let Ground::Tree(tree) = Grinder::Tree.apply(&datasets).unwrap() else {
            panic!("expected Tree");
        };
        assert_eq!(tree.images(), 2);
    }

    #[test]
    fn tag_grinder_extracts_per_dataset() {
        let datasets = vec![dataset("P1", "S1", "SE1", "I1")];
        let Ground::Tag(values) = Grinder::Tag(tags::PATIENT_ID).apply(&datasets).unwrap() else {
            panic!("expected Tag");
        };
        assert_eq!(values, vec![Some("P1".to_string())]);
    }

    #[test]
    fn many_tees_the_same_datasets() {
        let datasets = vec![dataset("P1", "S1", "SE1", "I1")];
        let grinder = Grinder::Many(vec![Grinder::List, Grinder::Tag(tags::PATIENT_ID)]);
        let Ground::Many(grounds) = grinder.apply(&datasets).unwrap() else {
            panic!("expected Many");
        };
        assert_eq!(grounds.len(), 2);
        assert!(matches!(grounds[0], Ground::List(_)));
        assert!(matches!(grounds[1], Ground::Tag(_)));
    }
}
