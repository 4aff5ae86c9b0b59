//! End-to-end processing of synthetic frames: target search, candidate
//! matching, offset reconciliation, apertures, overlaps and storage.


use std::time::Duration;

use apfind::overlap::overlap_check;
use apfind::pipeline::{self, ObservationOutcome};
use apfind::search::find_object;
use apfind::{
    CatalogCache, ClashRule, FindError, FrameImage, ImageSource, MemoryStore, ObjInd, ObsInd,
    ObservationInfo, ObservationState, OffsetChange, OverlapParams, PipelineConfig, ResultFilter,
    ResultStore, SearchParams,
};
use synthetic::{build, init_tracing, Placed, SceneLoader, NEIGHBOUR, STANDARD, TARGET, VICINITY};

const OFFSET: (f64, f64) = (2.4, -1.6);

fn config() -> PipelineConfig {
    PipelineConfig {
        search: SearchParams {
            shift_max: 5,
            ..Default::default()
        },
        workers: 2,
        lock_wait: Duration::from_millis(50),
        ..Default::default()
    }
}

fn info(obsind: u32) -> ObservationInfo {
    ObservationInfo::new(ObsInd(obsind), "V", "2024-09-12T21:40:00", VICINITY)
}

fn placed(id: u32) -> Placed {
    STANDARD
        .iter()
        .chain(std::iter::once(&NEIGHBOUR))
        .copied()
        .find(|p| p.id == id)
        .unwrap()
}

fn process(store: &MemoryStore, obsind: u32, offset: (f64, f64), seed: u64) -> ObservationOutcome {
    let (image, catalog) = build(&STANDARD, offset, seed);
    pipeline::process_observation(&image, &catalog, info(obsind), store, &config(), true).unwrap()
}

#[test]
fn subpixel_source_recovered() {
    init_tracing();
    let data = synthetic::render(100, 100, 10.0, 1.0, &[(50.3, 50.7, 1000.0)], 11);
    let image = FrameImage::new(data, 100, 100).unwrap();
    let params = SearchParams {
        shift_max: 3,
        ..Default::default()
    };

    let found = find_object(&image, 50.0, 50.0, None, None, &params).unwrap();

    assert!((found.row - 50.3).abs() < 1.0 && (found.col - 50.7).abs() < 1.0);
    assert!((found.rdiff - 0.3).abs() < 0.5, "rdiff {}", found.rdiff);
    assert!((found.cdiff - 0.7).abs() < 0.5, "cdiff {}", found.cdiff);
    assert!(found.adus > 0.0);
}

#[test]
fn full_observation_is_processed_and_stored() {
    init_tracing();
    let store = MemoryStore::new();
    let outcome = process(&store, 101, OFFSET, 1);

    assert_eq!(outcome.state, ObservationState::Persisted);
    assert_eq!(outcome.stats.attempted, 4, "far object must not be searched");
    assert_eq!(outcome.stats.found, 3);
    assert_eq!(outcome.stats.skipped, 1);
    assert_eq!(outcome.stats.failures[0].0, ObjInd(5));

    let set = &outcome.set;
    assert_eq!(set.target().obj, Some(TARGET));
    assert_eq!(set.target().label, "T");
    assert!((set.offset().row - OFFSET.0).abs() < 0.3, "offset {:?}", set.offset());
    assert!((set.offset().col - OFFSET.1).abs() < 0.3, "offset {:?}", set.offset());
    assert_eq!(
        set.object_ids(&ResultFilter::All),
        vec![ObjInd(1), ObjInd(2), ObjInd(3), ObjInd(4)]
    );
    for r in set.results() {
        let p = placed(r.obj.unwrap().0);
        assert!((r.row - (p.row + OFFSET.0)).abs() < 1.5, "{r:?}");
        assert!((r.col - (p.col + OFFSET.1)).abs() < 1.5, "{r:?}");
        assert!(r.apsize >= 2.0 && r.adus > 0.0);
    }
    assert!(overlap_check(set, &config().overlap).is_empty());

    assert_eq!(store.row_count(ObsInd(101)).unwrap(), 4);
    let loaded = store.load_for_observation(ObsInd(101)).unwrap().unwrap();
    assert_eq!(&loaded, set);
}

#[test]
fn reprocessing_with_replace_does_not_duplicate() {
    init_tracing();
    let store = MemoryStore::new();
    process(&store, 102, OFFSET, 2);
    let first = store.row_count(ObsInd(102)).unwrap();
    process(&store, 102, OFFSET, 2);
    assert_eq!(store.row_count(ObsInd(102)).unwrap(), first);
}

#[test]
fn worker_count_does_not_change_results() {
    init_tracing();
    let (image, catalog) = build(&STANDARD, OFFSET, 3);
    let serial = PipelineConfig {
        workers: 1,
        ..config()
    };
    let wide = PipelineConfig {
        workers: 4,
        ..config()
    };
    let (a, _) = pipeline::search(&image, &catalog, info(103), &serial).unwrap();
    let (b, _) = pipeline::search(&image, &catalog, info(103), &wide).unwrap();
    assert_eq!(a, b);
}

#[test]
fn missing_target_stores_nothing() {
    init_tracing();
    let without_target: Vec<Placed> = STANDARD
        .iter()
        .map(|p| if p.id == 1 { Placed { amp: 0.0, ..*p } } else { *p })
        .collect();
    let (image, catalog) = build(&without_target, OFFSET, 4);
    let store = MemoryStore::new();

    let failure = pipeline::process_observation(&image, &catalog, info(104), &store, &config(), true).unwrap_err();

    assert!(matches!(failure.error, FindError::Search(_)), "{failure:?}");
    assert_eq!(failure.state, ObservationState::SearchFailed);
    assert_eq!(failure.obsind, ObsInd(104));
    assert_eq!(store.row_count(ObsInd(104)).unwrap(), 0);
    assert!(store.load_for_observation(ObsInd(104)).unwrap().is_none());
}

#[test]
fn wrong_vicinity_rejected() {
    init_tracing();
    let (image, catalog) = build(&STANDARD, OFFSET, 5);
    let other = ObservationInfo::new(ObsInd(105), "V", "2024-09-12T21:40:00", "m31-field");
    let err = pipeline::search(&image, &catalog, other, &config());
    assert!(matches!(err, Err(FindError::CatalogMismatch { .. })), "{err:?}");
}

#[test]
fn busy_observation_conflicts() {
    init_tracing();
    let store = MemoryStore::new();
    let (image, catalog) = build(&STANDARD, OFFSET, 6);
    let held = store.lock_observation(ObsInd(106), Duration::ZERO).unwrap();

    let failure = pipeline::process_observation(&image, &catalog, info(106), &store, &config(), true).unwrap_err();

    assert!(matches!(failure.error, FindError::PersistenceConflict(ObsInd(106))));
    assert_eq!(failure.state, ObservationState::PersistenceConflict);
    assert_eq!(store.row_count(ObsInd(106)).unwrap(), 0);
    drop(held);
    assert!(pipeline::process_observation(&image, &catalog, info(106), &store, &config(), true).is_ok());
}

#[test]
fn neighbour_overlapping_target_is_hidden() {
    init_tracing();
    let mut objects = STANDARD.to_vec();
    objects.push(NEIGHBOUR);
    let (image, catalog) = build(&objects, OFFSET, 7);
    let config = PipelineConfig {
        overlap: OverlapParams {
            rule: ClashRule::FixedDistance(15.0),
        },
        ..config()
    };
    let store = MemoryStore::new();

    let outcome = pipeline::process_observation(&image, &catalog, info(107), &store, &config, true).unwrap();

    let lost: Vec<Option<ObjInd>> = outcome.optimized.overlaps.iter().map(|o| o.lost_obj).collect();
    assert_eq!(lost, vec![Some(ObjInd(6))]);
    let set = &outcome.set;
    let neighbour = set.get(set.position_of(ObjInd(6)).unwrap()).unwrap();
    assert!(neighbour.hide);
    assert!(neighbour.label.is_empty());
    assert!(!set.target().hide);
    assert!(overlap_check(set, &config.overlap).is_empty());
    // Hidden entries are still stored.
    assert_eq!(store.row_count(ObsInd(107)).unwrap(), 5);
}

#[test]
fn batch_records_terminal_states() {
    init_tracing();
    let without_target: Vec<Placed> = STANDARD
        .iter()
        .map(|p| if p.id == 1 { Placed { amp: 0.0, ..*p } } else { *p })
        .collect();
    let (blank, catalog) = build(&without_target, OFFSET, 12);
    let (good, _) = build(&STANDARD, OFFSET, 13);
    let mut cache = CatalogCache::new(SceneLoader { catalog });
    let store = MemoryStore::new();
    let _held = store.lock_observation(ObsInd(22), Duration::ZERO).unwrap();
    let frames: Vec<(&FrameImage, ObservationInfo)> = vec![(&blank, info(21)), (&good, info(22))];

    let report = pipeline::run_batch(frames, &mut cache, &store, &config(), true);

    let states: Vec<(ObsInd, ObservationState)> = report.failed.iter().map(|f| (f.obsind, f.state)).collect();
    assert_eq!(
        states,
        vec![
            (ObsInd(21), ObservationState::SearchFailed),
            (ObsInd(22), ObservationState::PersistenceConflict),
        ]
    );
    assert_eq!(report.exit_code(), 2);
}

#[test]
fn append_with_moved_pointing_keeps_stored_positions() {
    init_tracing();
    let store = MemoryStore::new();
    let first = process(&store, 109, OFFSET, 14).set;

    let shifted = (0.6, 1.4);
    let without_three: Vec<Placed> = STANDARD
        .iter()
        .map(|p| if p.id == 3 { Placed { amp: 0.0, ..*p } } else { *p })
        .collect();
    let (image, catalog) = build(&without_three, shifted, 15);
    pipeline::process_observation(&image, &catalog, info(109), &store, &config(), false).unwrap();

    let merged = store.load_for_observation(ObsInd(109)).unwrap().unwrap();
    let kept_before = first.get(first.position_of(ObjInd(3)).unwrap()).unwrap();
    let kept_after = merged.get(merged.position_of(ObjInd(3)).unwrap()).unwrap();
    assert_eq!(kept_after.row, kept_before.row);
    let before = first.offset().row + kept_before.rdiff;
    let after = merged.offset().row + kept_after.rdiff;
    assert!((before - after).abs() < 1e-9, "{before} vs {after}");
    assert!((merged.offset().row - shifted.0).abs() < 0.3);
}

#[test]
fn refound_target_moves_stored_offsets() {
    init_tracing();
    let store = MemoryStore::new();
    let before = process(&store, 108, OFFSET, 8).set;

    let shifted = (-1.2, 3.1);
    let (image, catalog) = build(&STANDARD, shifted, 9);
    let (after, change) = pipeline::refind_target(&image, &catalog, ObsInd(108), &store, &config()).unwrap();

    let OffsetChange::Applied { delta, adjusted } = change else {
        panic!("offset should have moved: {change:?}");
    };
    assert_eq!(adjusted, before.len() - 1);
    assert!((after.offset().row - shifted.0).abs() < 0.3);
    assert!((after.offset().col - shifted.1).abs() < 0.3);
    for (old, new) in before.results().iter().zip(after.results()).skip(1) {
        assert_eq!(old.obj, new.obj);
        assert!((new.rdiff - (old.rdiff - delta.row)).abs() < 1e-9);
        assert!((new.cdiff - (old.cdiff - delta.col)).abs() < 1e-9);
    }
    assert_eq!(store.load_for_observation(ObsInd(108)).unwrap().unwrap(), after);
}

#[test]
fn batch_reports_failures_and_continues() {
    init_tracing();
    let (good, catalog) = build(&STANDARD, OFFSET, 10);
    let mut cache = CatalogCache::new(SceneLoader { catalog });
    let store = MemoryStore::new();
    let stray = ObservationInfo::new(ObsInd(2), "V", "2024-09-13T01:00:00", "unknown-field");
    let frames: Vec<(&FrameImage, ObservationInfo)> = vec![(&good, info(1)), (&good, stray), (&good, info(3))];

    let report = pipeline::run_batch(frames, &mut cache, &store, &config(), true);

    assert_eq!(report.processed, 2);
    assert_eq!(report.found, 6);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].obsind, ObsInd(2));
    assert_eq!(report.failed[0].state, ObservationState::Empty);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(cache.loaded(), 1);
    assert!(good.field_of_view().is_some());
}
