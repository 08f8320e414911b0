//! Integration test: link organoids across imaging rounds of one well.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};

use orglink_pipeline::snapshot::{RawSegmentationRecord, Snapshot, TransformRepr};
use orglink_pipeline::{
    AffineTransform, Contour, Execution, ImageType, LinkingConfig, LinkingMode, MemorySink,
    NoClock, ObjectId, ObjectIdAllocator, PartitionOutcome, SegmentationId, SegmentationRecord,
    link_all,
};

fn organoid(id: u64, round: i64, label: i64, bbox: (f64, f64, f64, f64)) -> SegmentationRecord {
    SegmentationRecord {
        id: SegmentationId(id),
        object_id: None,
        well: "A1".to_string(),
        fixation: "Day1full".to_string(),
        time_point: 1,
        round,
        z_index: 0,
        label,
        image_type: ImageType::Label,
        contour: Contour::rectangle(bbox.0, bbox.1, bbox.2, bbox.3),
        seg_to_image: AffineTransform::IDENTITY,
        image_to_microscope: AffineTransform::IDENTITY,
    }
}

/// Nine rounds of one well; rounds 3 and 4 are empty.
fn nine_rounds() -> Vec<SegmentationRecord> {
    vec![
        organoid(1, 1, 1, (0.0, 0.0, 1000.0, 1000.0)),
        organoid(2, 1, 2, (2000.0, 0.0, 3000.0, 1000.0)),
        organoid(3, 2, 3, (250.0, 250.0, 1250.0, 1250.0)),
        organoid(4, 5, 4, (5000.0, 0.0, 6000.0, 1000.0)),
        organoid(5, 6, 5, (0.0, 0.0, 1000.0, 1000.0)),
        organoid(6, 6, 6, (5000.0, 0.0, 7000.0, 2000.0)),
        organoid(7, 7, 7, (0.0, 0.0, 1000.0, 1000.0)),
        organoid(8, 7, 8, (5000.0, 0.0, 6000.0, 1000.0)),
        organoid(9, 8, 9, (0.0, 0.0, 1000.0, 1000.0)),
    ]
}

fn run(records: Vec<SegmentationRecord>, execution: Execution) -> Vec<PartitionOutcome> {
    let sink = MemorySink::new();
    link_all(
        records,
        LinkingMode::Rounds,
        &LinkingConfig::default(),
        &ObjectIdAllocator::default(),
        &sink,
        &NoClock,
        execution,
    )
    .expect("linking should succeed");
    sink.into_outcomes()
}

fn owners(outcomes: &[PartitionOutcome]) -> HashMap<SegmentationId, ObjectId> {
    outcomes
        .iter()
        .flat_map(|o| &o.assignments)
        .map(|a| (a.segmentation, a.object))
        .collect()
}

#[test]
fn nine_round_well_yields_seven_objects() {
    let outcomes = run(nine_rounds(), Execution::Parallel);
    assert_eq!(outcomes.len(), 1);

    let outcome = &outcomes[0];
    assert_eq!(outcome.objects.len(), 7);
    assert_eq!(outcome.segmentations, 9);

    // Every segmentation ends up in exactly one object.
    let owners = owners(&outcomes);
    assert_eq!(owners.len(), 9);

    // Rounds 6 -> 7 -> 8 at the first box share one object.
    let chain: HashSet<ObjectId> = [5, 7, 9]
        .into_iter()
        .map(|id| owners[&SegmentationId(id)])
        .collect();
    assert_eq!(chain.len(), 1);

    // Round 1 -> 2 overlaps only partially and stays below the threshold.
    assert_ne!(owners[&SegmentationId(1)], owners[&SegmentationId(3)]);
    assert_eq!(outcome.rejections.len(), 2);
}

#[test]
fn round_without_drift_estimate_is_not_linked() {
    // Round 5 has nothing near the reference round, so no shift, so its
    // organoid never links into round 7 even though they coincide.
    let owners = owners(&run(nine_rounds(), Execution::Sequential));
    assert_ne!(owners[&SegmentationId(4)], owners[&SegmentationId(8)]);
}

#[test]
fn sequential_execution_numbers_objects_in_position_order() {
    let outcomes = run(nine_rounds(), Execution::Sequential);
    let owners = owners(&outcomes);
    assert_eq!(owners[&SegmentationId(1)], ObjectId(1));
    assert_eq!(owners[&SegmentationId(2)], ObjectId(2));
    assert_eq!(owners[&SegmentationId(9)], owners[&SegmentationId(5)]);
}

#[test]
fn stage_drift_is_corrected_before_scoring() {
    // Round 2 was re-mounted 120 right and 80 down. Uncorrected, the
    // centroids sit exactly at the 200 cutoff and nothing would link.
    let drift = AffineTransform::translation(120.0, 80.0);
    let mut records = vec![
        organoid(1, 1, 1, (0.0, 0.0, 400.0, 400.0)),
        organoid(2, 1, 2, (1000.0, 0.0, 1400.0, 400.0)),
        organoid(3, 2, 1, (0.0, 0.0, 400.0, 400.0)),
        organoid(4, 2, 2, (1000.0, 0.0, 1400.0, 400.0)),
    ];
    for record in &mut records[2..] {
        record.image_to_microscope = drift;
    }

    // Persist the drifted transforms in their binary form.
    let snapshot = Snapshot {
        records: records
            .iter()
            .map(|r| {
                let mut raw = RawSegmentationRecord::from(r);
                raw.image_to_microscope =
                    TransformRepr::Encoded(r.image_to_microscope.encode().to_vec());
                raw
            })
            .collect(),
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    let decoded = serde_json::from_str::<Snapshot>(&json)
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(decoded, records);

    let outcomes = run(decoded, Execution::Parallel);
    let outcome = &outcomes[0];
    assert_eq!(outcome.objects.len(), 2);
    assert!(outcome.objects.iter().all(|o| o.members.len() == 2));
    assert!(outcome.rejections.is_empty());
}

#[test]
fn non_finite_transform_payload_is_left_unlinked() {
    // Well-formed payload whose x offset is NaN.
    let mut rows = *AffineTransform::IDENTITY.rows();
    rows[0][3] = f64::NAN;
    let payload = AffineTransform::from_rows(rows).encode().to_vec();

    let snapshot = Snapshot {
        records: nine_rounds()
            .iter()
            .map(|r| {
                let mut raw = RawSegmentationRecord::from(r);
                if r.id == SegmentationId(3) {
                    raw.seg_to_image = TransformRepr::Encoded(payload.clone());
                }
                raw
            })
            .collect(),
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    let records = serde_json::from_str::<Snapshot>(&json)
        .unwrap()
        .decode()
        .expect("a NaN entry is still a decodable payload");
    assert_eq!(records.len(), 9);

    for execution in [Execution::Parallel, Execution::Sequential] {
        let sink = MemorySink::new();
        let summary = link_all(
            records.clone(),
            LinkingMode::Rounds,
            &LinkingConfig::default(),
            &ObjectIdAllocator::default(),
            &sink,
            &NoClock,
            execution,
        )
        .expect("linking should succeed");
        assert_eq!(summary.segmentations, 9);

        let outcomes = sink.into_outcomes();
        let owners = owners(&outcomes);
        assert_eq!(owners.len(), 9);
        let lonely = owners[&SegmentationId(3)];
        assert!(
            owners
                .iter()
                .all(|(seg, obj)| *seg == SegmentationId(3) || *obj != lonely)
        );
        // The rest of the well still links.
        assert_eq!(owners[&SegmentationId(7)], owners[&SegmentationId(9)]);
    }
}

#[test]
fn persisted_objects_are_extended_not_replaced() {
    let mut records = vec![
        organoid(1, 1, 1, (0.0, 0.0, 500.0, 500.0)),
        organoid(2, 2, 1, (0.0, 0.0, 500.0, 500.0)),
    ];
    records[0].object_id = Some(ObjectId(41));
    let allocator = ObjectIdAllocator::after(records.iter().filter_map(|r| r.object_id));

    let sink = MemorySink::new();
    link_all(
        records,
        LinkingMode::Rounds,
        &LinkingConfig::default(),
        &allocator,
        &sink,
        &NoClock,
        Execution::Parallel,
    )
    .unwrap();
    let outcomes = sink.into_outcomes();
    assert!(outcomes[0].objects.is_empty());
    assert_eq!(owners(&outcomes)[&SegmentationId(2)], ObjectId(41));
    assert_eq!(allocator.allocate(), ObjectId(42));
}

#[test]
fn wells_and_fixations_are_independent() {
    let mut records = nine_rounds();
    let mut other = organoid(100, 1, 1, (0.0, 0.0, 1000.0, 1000.0));
    other.well = "B3".to_string();
    records.push(other);
    let mut later = organoid(101, 2, 1, (0.0, 0.0, 1000.0, 1000.0));
    later.time_point = 2;
    records.push(later);

    let outcomes = run(records, Execution::Parallel);
    assert_eq!(outcomes.len(), 3);
    let total: usize = outcomes.iter().map(|o| o.objects.len()).sum();
    assert_eq!(total, 9);
}
