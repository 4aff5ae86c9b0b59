//! Snapshot-file store behaviour across reopen.


use std::time::Duration;

use apfind::pipeline;
use apfind::store::AduCalcRow;
use apfind::{
    ApertureAssignment, ApertureVotes, ClashRule, FileStore, FindError, ObjInd, ObsInd, ObservationInfo,
    ObservationState, OverlapParams, PipelineConfig, ResultFilter, ResultStore, SearchParams, Suppression,
};
use synthetic::{build, init_tracing, NEIGHBOUR, STANDARD, VICINITY};

fn config() -> PipelineConfig {
    PipelineConfig {
        search: SearchParams {
            shift_max: 5,
            ..Default::default()
        },
        workers: 2,
        ..Default::default()
    }
}

fn info(obsind: u32) -> ObservationInfo {
    ObservationInfo::new(ObsInd(obsind), "R", "2024-10-02T03:15:00", VICINITY)
}

fn photometry(obsind: u32, objind: u32) -> AduCalcRow {
    AduCalcRow {
        obsind: ObsInd(obsind),
        objind: ObjInd(objind),
        apsize: 6.0,
        adus: 12_000.0,
        npix: 113,
        sky: 100.0,
    }
}

#[test]
fn snapshot_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    let (image, catalog) = build(&STANDARD, (1.0, 2.0), 21);

    let saved = {
        let store = FileStore::open(&path).unwrap();
        let outcome =
            pipeline::process_observation(&image, &catalog, info(201), &store, &config(), true).unwrap();
        store.save_photometry(ObsInd(201), &[photometry(201, 2)]).unwrap();
        outcome.set
    };
    assert!(path.exists());

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.load_for_observation(ObsInd(201)).unwrap(), Some(saved.clone()));
    assert_eq!(reopened.row_count(ObsInd(201)).unwrap(), saved.len());
    assert_eq!(reopened.photometry(ObsInd(201)).unwrap(), vec![photometry(201, 2)]);
}

#[test]
fn replace_cascades_and_keeps_row_count() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path().join("results.rkyv")).unwrap();
    let (image, catalog) = build(&STANDARD, (0.0, 0.0), 22);
    let (set, _) = pipeline::search(&image, &catalog, info(202), &config()).unwrap();

    store.save(&set, true).unwrap();
    store
        .save_photometry(ObsInd(202), &[photometry(202, 1), photometry(202, 3)])
        .unwrap();
    let before = store.row_count(ObsInd(202)).unwrap();

    let summary = pipeline::persist(&store, &set, true).unwrap();

    assert_eq!(summary.replaced, before);
    assert_eq!(summary.cascaded, 2);
    assert_eq!(store.row_count(ObsInd(202)).unwrap(), before);
    assert!(store.photometry(ObsInd(202)).unwrap().is_empty());
}

#[test]
fn failed_write_leaves_snapshot_untouched() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    let store = FileStore::open(&path).unwrap();
    let (image, catalog) = build(&STANDARD, (0.0, 0.0), 23);
    let (set, _) = pipeline::search(&image, &catalog, info(203), &config()).unwrap();
    store.save(&set, true).unwrap();
    let bytes = std::fs::read(&path).unwrap();

    let orphan = store.save_photometry(ObsInd(203), &[photometry(203, 2), photometry(203, 77)]);

    assert!(matches!(orphan, Err(FindError::Storage(_))));
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    assert!(store.photometry(ObsInd(203)).unwrap().is_empty());
}

#[test]
fn suppressed_object_removed_everywhere() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    let store = FileStore::open(&path).unwrap();
    let (image, catalog) = build(&STANDARD, (0.5, 0.5), 24);
    for obsind in [204, 205] {
        let (set, _) = pipeline::search(&image, &catalog, info(obsind), &config()).unwrap();
        store.save(&set, true).unwrap();
    }
    store.save_photometry(ObsInd(204), &[photometry(204, 4)]).unwrap();

    assert_eq!(store.remove_object(ObjInd(4)).unwrap(), 3);
    assert!(matches!(store.remove_object(ObjInd(1)), Err(FindError::Configuration(_))));

    let reopened = FileStore::open(&path).unwrap();
    for obsind in [204, 205] {
        let set = reopened.load_for_observation(ObsInd(obsind)).unwrap().unwrap();
        assert!(set.object_ids(&ResultFilter::All).iter().all(|&id| id != ObjInd(4)));
    }
}

#[test]
fn overlap_removal_commits_with_the_save() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    let store = FileStore::open(&path).unwrap();
    let mut objects = STANDARD.to_vec();
    objects.push(NEIGHBOUR);
    let (image, catalog) = build(&objects, (0.0, 0.0), 25);
    let hide = PipelineConfig {
        overlap: OverlapParams {
            rule: ClashRule::FixedDistance(15.0),
        },
        ..config()
    };
    let remove = PipelineConfig {
        suppression: Suppression::Remove,
        ..hide.clone()
    };
    pipeline::process_observation(&image, &catalog, info(206), &store, &hide, true).unwrap();
    assert_eq!(store.row_count(ObsInd(206)).unwrap(), 5);

    // A directory in the way of the temporary file makes the commit fail.
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    std::fs::create_dir(&tmp).unwrap();
    let failure = pipeline::process_observation(&image, &catalog, info(207), &store, &remove, true).unwrap_err();
    assert!(matches!(failure.error, FindError::Storage(_)), "{failure:?}");
    assert_eq!(failure.state, ObservationState::OverlapResolved);
    assert_eq!(store.row_count(ObsInd(206)).unwrap(), 5);
    assert_eq!(store.row_count(ObsInd(207)).unwrap(), 0);
    assert_eq!(FileStore::open(&path).unwrap().row_count(ObsInd(206)).unwrap(), 5);

    std::fs::remove_dir(&tmp).unwrap();
    let outcome = pipeline::process_observation(&image, &catalog, info(207), &store, &remove, true).unwrap();
    assert_eq!(outcome.saved.suppressed, 2);
    assert_eq!(outcome.set.position_of(ObjInd(6)), None);
    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.row_count(ObsInd(206)).unwrap(), 4);
    assert_eq!(reopened.row_count(ObsInd(207)).unwrap(), 4);
}

#[test]
fn aperture_assignments_follow_votes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    let store = FileStore::open(&path).unwrap();

    let mut votes = ApertureVotes::new(0.5).unwrap();
    for r in [5.0, 5.0, 5.5, 5.0, 4.5, 5.0] {
        votes.add(r);
    }
    let established = votes.assignment().unwrap();
    assert!(store.update_aperture(ObjInd(3), established).unwrap());

    let challenger = ApertureAssignment {
        apsize: 7.0,
        nsamples: 2,
        stddev: 0.0,
    };
    assert!(!store.update_aperture(ObjInd(3), challenger).unwrap());

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.aperture(ObjInd(3)).unwrap(), Some(established));
    assert_eq!(reopened.aperture(ObjInd(4)).unwrap(), None);
}

#[test]
fn lock_wait_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path().join("results.rkyv")).unwrap();
    let _held = store.lock_observation(ObsInd(9), Duration::ZERO).unwrap();
    let err = store.lock_observation(ObsInd(9), Duration::from_millis(30));
    assert!(matches!(err, Err(FindError::PersistenceConflict(ObsInd(9)))));
}

#[test]
fn corrupt_snapshot_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.rkyv");
    std::fs::write(&path, b"not a snapshot").unwrap();
    let err = FileStore::open(&path).unwrap_err();
    assert!(format!("{err:#}").contains("Corrupt result snapshot"));
}
