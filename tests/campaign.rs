use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use isodb_sync::app::{App, SyncOptions};
use isodb_sync::campaign::{BatchFetcher, CampaignOptions, DEFAULT_CAMPAIGN};
use isodb_sync::domain::{RecordKey, ResourceKind};
use isodb_sync::error::{FetchError, FetchErrorKind, SyncError};
use isodb_sync::fetch::IsodbClient;
use isodb_sync::output::JsonOutput;
use isodb_sync::records::{IsothermDetail, RawPoint, RecordBatch, parse_collection};
use isodb_sync::store::Store;

#[derive(Default)]
struct MockDetails {
    failing: Mutex<BTreeSet<String>>,
    panic_on: Mutex<Option<String>>,
    fetched: Mutex<Vec<String>>,
    listing: Mutex<Option<Value>>,
}

impl MockDetails {
    fn failing(keys: &[&str]) -> Self {
        let mock = Self::default();
        mock.failing
            .lock()
            .unwrap()
            .extend(keys.iter().map(|key| key.to_string()));
        mock
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl IsodbClient for MockDetails {
    fn fetch(&self, kind: ResourceKind) -> Result<RecordBatch, SyncError> {
        let body = self.listing.lock().unwrap().clone().unwrap_or_else(|| json!([]));
        parse_collection(kind, &body, None)
    }

    fn fetch_isotherm_index(&self) -> Result<Value, SyncError> {
        Ok(json!([]))
    }

    fn fetch_isotherm(&self, filename: &RecordKey) -> Result<IsothermDetail, SyncError> {
        let name = filename.as_str().to_string();
        let should_panic = self.panic_on.lock().unwrap().as_deref() == Some(name.as_str());
        if should_panic {
            panic!("simulated crash while fetching {name}");
        }
        self.fetched.lock().unwrap().push(name.clone());
        if self.failing.lock().unwrap().contains(&name) {
            return Err(FetchError {
                kind: FetchErrorKind::Fatal,
                url: format!("mock://isotherm/{name}.json"),
                status: Some(404),
                attempts: 1,
                message: "not found".to_string(),
            }
            .into());
        }
        Ok(detail(filename))
    }
}

fn detail(filename: &RecordKey) -> IsothermDetail {
    IsothermDetail {
        filename: filename.clone(),
        pressure_units: Some("bar".to_string()),
        adsorption_units: Some("mmol/g".to_string()),
        adsorbates: vec!["CURLTUGMZLYLDI-UHFFFAOYSA-N".to_string()],
        temperature: Some(298.0),
        points: vec![RawPoint {
            pressure: Some(1.0),
            total_adsorption: Some(2.5),
            species_data: Value::Null,
        }],
    }
}

fn keys(count: usize) -> Vec<RecordKey> {
    (1..=count)
        .map(|idx| format!("iso-{idx}").parse().unwrap())
        .collect()
}

fn options(batch_size: usize) -> CampaignOptions {
    CampaignOptions {
        batch_size,
        max_batch_failure_rate: 0.5,
        force: false,
    }
}

#[test]
fn failed_records_do_not_stop_the_campaign() {
    let store = Store::open_in_memory().unwrap();
    let client = MockDetails::failing(&["iso-4"]);

    let result = BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(5), &options(2))
        .unwrap();
    assert_eq!(result.batches, 3);
    assert_eq!(result.attempted, 5);
    assert_eq!(result.succeeded, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failures[0].key.as_str(), "iso-4");
    assert_eq!(result.failures[0].kind, FetchErrorKind::Fatal);
    assert_eq!(result.checkpoint.last_key.as_ref().unwrap().as_str(), "iso-5");
    assert_eq!(store.isotherm_detail_count().unwrap(), 4);
    assert_eq!(store.campaign_failure_count(DEFAULT_CAMPAIGN).unwrap(), 1);

    let rerun = BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(5), &options(2))
        .unwrap();
    assert_eq!(rerun.skipped_checkpoint, 5);
    assert_eq!(rerun.attempted, 0);
    assert_eq!(client.fetched().len(), 5);
}

#[test]
fn resumes_at_interrupted_batch_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("isodb.db")).unwrap();

    {
        let store = Store::open(&path).unwrap();
        let client = MockDetails::default();
        *client.panic_on.lock().unwrap() = Some("iso-4".to_string());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            BatchFetcher::new(&store, &client).run_campaign(
                DEFAULT_CAMPAIGN,
                keys(5),
                &options(2),
            )
        }));
        assert!(outcome.is_err());
        assert_eq!(client.fetched(), vec!["iso-1", "iso-2", "iso-3"]);
    }

    let store = Store::open(&path).unwrap();
    let checkpoint = store.load_checkpoint(DEFAULT_CAMPAIGN).unwrap().unwrap();
    assert_eq!(checkpoint.last_key.unwrap().as_str(), "iso-2");
    assert_eq!(checkpoint.succeeded, 2);

    let client = MockDetails::default();
    let result = BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(5), &options(2))
        .unwrap();
    assert_eq!(client.fetched(), vec!["iso-4", "iso-5"]);
    assert_eq!(result.skipped_checkpoint, 2);
    assert_eq!(result.skipped_fresh, 1);
    assert_eq!(result.checkpoint.succeeded, 4);
    assert_eq!(store.isotherm_detail_count().unwrap(), 5);
}

#[test]
fn failing_batch_aborts_without_checkpoint() {
    let store = Store::open_in_memory().unwrap();
    let client = MockDetails::failing(&["iso-1", "iso-2"]);

    let err = BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(4), &options(2))
        .unwrap_err();
    assert_matches!(
        err,
        SyncError::CampaignAborted {
            batch: 0,
            attempted: 2,
            failed: 2,
            ..
        }
    );
    assert!(store.load_checkpoint(DEFAULT_CAMPAIGN).unwrap().is_none());
    assert_eq!(client.fetched(), vec!["iso-1", "iso-2"]);
    assert_eq!(store.campaign_failure_count(DEFAULT_CAMPAIGN).unwrap(), 2);
}

#[test]
fn force_refetches_stored_details() {
    let store = Store::open_in_memory().unwrap();
    let client = MockDetails::default();
    BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(3), &options(10))
        .unwrap();

    let forced = CampaignOptions {
        force: true,
        ..options(10)
    };
    let result = BatchFetcher::new(&store, &client)
        .run_campaign(DEFAULT_CAMPAIGN, keys(3), &forced)
        .unwrap();
    assert_eq!(result.skipped_checkpoint, 0);
    assert_eq!(result.attempted, 3);
    assert_eq!(client.fetched().len(), 6);
    assert_eq!(store.point_count().unwrap(), 3);
}

#[test]
fn app_campaign_defaults_to_stored_isotherms() {
    let client = MockDetails::default();
    *client.listing.lock().unwrap() = Some(json!([
        {"filename": "iso-b", "adsorbent": {"hashkey": "M1"}},
        {"filename": "iso-a", "adsorbent": {"hashkey": "M1"}}
    ]));
    let app = App::new(Store::open_in_memory().unwrap(), client);
    app.sync(ResourceKind::Isotherms, SyncOptions::default(), &JsonOutput)
        .unwrap();

    let options = app.campaign_options(Some(1), false);
    assert_eq!(options.batch_size, 1);
    let result = app
        .run_campaign("details", None, options, &JsonOutput)
        .unwrap();
    assert_eq!(result.candidates, 2);
    assert_eq!(result.batches, 2);
    assert_eq!(app.client().fetched(), vec!["iso-a", "iso-b"]);
}
