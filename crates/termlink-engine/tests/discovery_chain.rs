//! Discovery chain runs against a scripted correlator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use termlink_engine::{
    EngineConfig, MemoryRepository, NameDecoration, ObjectFactory, Terminus,
};
use termlink_proto::{
    protocol_type, record_type, CommandBitmap, CompactSensorRecord, EndpointId,
    NumericEffecterRecord, Request, Response, Token, TransferFlag, TypeBitmap,
    COMPLETION_SUCCESS, TID_UNASSIGNED,
};
use termlink_transport::{Correlator, CorrelatorError, TokenPool};

const ENDPOINT: EndpointId = 11;

struct ScriptedCorrelator {
    script: Mutex<VecDeque<Result<Response, CorrelatorError>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedCorrelator {
    fn new(script: Vec<Result<Response, CorrelatorError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Correlator for ScriptedCorrelator {
    async fn transfer(
        &self,
        endpoint: EndpointId,
        _token: Token,
        request: Request,
    ) -> Result<Response, CorrelatorError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CorrelatorError::NoResponse(endpoint)))
    }
}

/// Records every sensor and effecter the discovery run materializes.
#[derive(Default)]
struct CapturingFactory {
    sensors: Mutex<Vec<(String, CompactSensorRecord)>>,
    effecters: Mutex<Vec<(String, NumericEffecterRecord)>>,
}

impl ObjectFactory for CapturingFactory {
    fn build_sensor(&self, _endpoint: EndpointId, name: &str, record: &CompactSensorRecord) {
        self.sensors.lock().unwrap().push((name.to_string(), record.clone()));
    }

    fn build_effecter(&self, _endpoint: EndpointId, name: &str, record: &NumericEffecterRecord) {
        self.effecters
            .lock()
            .unwrap()
            .push((name.to_string(), record.clone()));
    }
}

fn config() -> EngineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    EngineConfig {
        attempt_timeout_ms: 20,
        ..Default::default()
    }
}

fn ok_types(types: &[u8]) -> Result<Response, CorrelatorError> {
    Ok(Response::SupportedTypes {
        completion: COMPLETION_SUCCESS,
        types: TypeBitmap::with_types(types),
    })
}

fn ok_commands() -> Result<Response, CorrelatorError> {
    Ok(Response::SupportedCommands {
        completion: COMPLETION_SUCCESS,
        commands: CommandBitmap::default(),
    })
}

fn record_page(record_type: u8, handle: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(handle);
    buf.put_u8(1);
    buf.put_u8(record_type);
    buf.put_u16_le(0);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(body);
    buf.freeze()
}

fn association_body() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16_le(1); // terminus handle
    body.put_u8(0); // physical containment
    for v in [10u16, 1, 0] {
        body.put_u16_le(v); // container entity
    }
    body.put_u8(1); // one child
    for v in [20u16, 1, 10] {
        body.put_u16_le(v);
    }
    body.freeze()
}

fn sensor_body(name: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16_le(1); // terminus handle
    body.put_u16_le(42); // sensor id
    for v in [100u16, 1, 0] {
        body.put_u16_le(v); // entity
    }
    body.put_u8(2); // base unit
    body.put_i8(-3);
    body.put_u8(1);
    body.put_u8(0b0101);
    body.put_i32_le(90);
    body.put_i32_le(0);
    body.put_i32_le(100);
    body.put_i32_le(0);
    body.put_u8((name.len() + 1) as u8);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.freeze()
}

fn record_response(
    next_record_handle: u32,
    next_transfer_handle: u32,
    transfer_flag: TransferFlag,
    record: Bytes,
) -> Result<Response, CorrelatorError> {
    Ok(Response::DescriptionRecord {
        completion: COMPLETION_SUCCESS,
        next_record_handle,
        next_transfer_handle,
        transfer_flag,
        record,
    })
}

#[tokio::test]
async fn tid_failure_still_loads_description_records() {
    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::BASE, protocol_type::PLATFORM]),
        ok_commands(), // base
        ok_commands(), // platform
        Err(CorrelatorError::NoResponse(ENDPOINT)), // terminus id query
        Ok(Response::EventReceiverRegistered {
            completion: COMPLETION_SUCCESS,
        }),
        record_response(
            2,
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::ASSOCIATION, 1, &association_body()),
        ),
        record_response(
            0, // terminator: this was the last record
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::COMPACT_SENSOR, 2, &sensor_body("CPU Temp")),
        ),
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator.clone(),
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(outcome.responsive);
    assert!(outcome.records_complete);
    assert_eq!(outcome.records_loaded, 2);
    assert_eq!(terminus.profile().tid, TID_UNASSIGNED);

    // association merged during the loop, full set committed at the end
    assert_eq!(repository.associations(ENDPOINT).len(), 1);
    assert_eq!(repository.records(ENDPOINT).len(), 2);

    // no decoration configured, so the name falls back to a tid suffix
    let sensors = factory.sensors.lock().unwrap();
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors[0].0, format!("CPU_Temp_TID{TID_UNASSIGNED}"));
    assert_eq!(sensors[0].1.sensor_id, 42);

    // no config/fru support advertised, so no clock push or inventory fetch
    let requests = correlator.requests();
    assert!(!requests
        .iter()
        .any(|r| matches!(r, Request::SetDateTime { .. } | Request::QueryFruTableMetadata)));
}

#[tokio::test]
async fn unresponsive_endpoint_aborts_the_chain() {
    let correlator = ScriptedCorrelator::new(Vec::new());
    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator.clone(),
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(!outcome.responsive);
    // only the initial capability query went out
    assert_eq!(correlator.requests().len(), 1);
    assert!(repository.records(ENDPOINT).is_empty());
}

#[tokio::test]
async fn fragmented_record_page_is_reassembled() {
    let page = record_page(record_type::COMPACT_SENSOR, 1, &sensor_body("Inlet"));
    let (first, rest) = page.split_at(7);

    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::PLATFORM]),
        ok_commands(),
        Err(CorrelatorError::NoResponse(ENDPOINT)), // terminus id
        Ok(Response::EventReceiverRegistered {
            completion: COMPLETION_SUCCESS,
        }),
        record_response(0, 77, TransferFlag::Start, Bytes::copy_from_slice(first)),
        record_response(0, 0, TransferFlag::End, Bytes::copy_from_slice(rest)),
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator.clone(),
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(outcome.records_complete);
    assert_eq!(outcome.records_loaded, 1);
    assert_eq!(factory.sensors.lock().unwrap().len(), 1);

    // the continuation carried the handle the first fragment announced
    let requests = correlator.requests();
    assert!(matches!(
        requests.last(),
        Some(Request::FetchDescriptionRecord {
            transfer_handle: 77,
            ..
        })
    ));
}

#[tokio::test]
async fn configured_decoration_prefixes_sensor_names() {
    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::PLATFORM]),
        ok_commands(),
        Ok(Response::TerminusId {
            completion: COMPLETION_SUCCESS,
            tid: 2,
        }),
        Ok(Response::EventReceiverRegistered {
            completion: COMPLETION_SUCCESS,
        }),
        record_response(
            0,
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::COMPACT_SENSOR, 1, &sensor_body("DIMM Temp")),
        ),
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator,
        Arc::new(TokenPool::new()),
        config(),
    )
    .with_decoration(Some(NameDecoration {
        text: "S0_".into(),
        prefix: true,
    }));
    terminus.discover(&repository, &factory).await;

    let sensors = factory.sensors.lock().unwrap();
    assert_eq!(sensors[0].0, "S0_DIMM_Temp");
    assert_eq!(terminus.profile().tid, 2);
}

#[tokio::test]
async fn fru_inventory_is_pulled_when_advertised() {
    let mut table = BytesMut::new();
    table.put_u16_le(1); // record set
    table.put_u8(1); // record kind
    table.put_u8(1); // one field
    table.put_u8(1); // ASCII
    table.put_u8(4); // serial-number field
    table.put_u8(6);
    table.put_slice(b"SN1234");

    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::BASE, protocol_type::FRU]),
        ok_commands(), // base
        ok_commands(), // fru
        Ok(Response::TerminusId {
            completion: COMPLETION_SUCCESS,
            tid: 4,
        }),
        Ok(Response::FruTableMetadata {
            completion: COMPLETION_SUCCESS,
            total_records: 1,
        }),
        Ok(Response::FruTable {
            completion: COMPLETION_SUCCESS,
            next_transfer_handle: 0,
            transfer_flag: TransferFlag::StartAndEnd,
            table: table.freeze(),
        }),
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator,
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(outcome.responsive);
    let fields = &terminus.profile().fru_fields;
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].field_type, 4);
    assert_eq!(fields[0].value, "SN1234");
}

#[tokio::test]
async fn invalid_locator_is_reported_not_committed() {
    let mut valid = BytesMut::new();
    valid.put_u16_le(0x0101);
    valid.put_u8(1); // valid
    valid.put_u8(2); // tid
    valid.put_u8(ENDPOINT);

    let mut invalid = BytesMut::new();
    invalid.put_u16_le(0x0202);
    invalid.put_u8(0); // invalid
    invalid.put_u8(0);
    invalid.put_u8(ENDPOINT);

    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::PLATFORM]),
        ok_commands(),
        Ok(Response::TerminusId {
            completion: COMPLETION_SUCCESS,
            tid: 2,
        }),
        Ok(Response::EventReceiverRegistered {
            completion: COMPLETION_SUCCESS,
        }),
        record_response(
            2,
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::TERMINUS_LOCATOR, 1, &valid.freeze()),
        ),
        record_response(
            0,
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::TERMINUS_LOCATOR, 2, &invalid.freeze()),
        ),
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator,
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(outcome.records_complete);
    // only the valid locator was committed and tracked in the profile
    assert_eq!(repository.records(ENDPOINT).len(), 1);
    assert_eq!(repository.invalid_locators(ENDPOINT), vec![0x0202]);
    assert!(terminus.profile().locators.contains_key(&0x0101));
    assert!(!terminus.profile().locators.contains_key(&0x0202));
}

#[tokio::test]
async fn record_loop_failure_commits_partial_set() {
    let correlator = ScriptedCorrelator::new(vec![
        ok_types(&[protocol_type::PLATFORM]),
        ok_commands(),
        Err(CorrelatorError::NoResponse(ENDPOINT)), // terminus id
        Ok(Response::EventReceiverRegistered {
            completion: COMPLETION_SUCCESS,
        }),
        record_response(
            5, // more records follow
            0,
            TransferFlag::StartAndEnd,
            record_page(record_type::COMPACT_SENSOR, 1, &sensor_body("Outlet")),
        ),
        // next fetch never answers
    ]);

    let repository = MemoryRepository::new();
    let factory = CapturingFactory::default();
    let mut terminus = Terminus::new(
        ENDPOINT,
        correlator,
        Arc::new(TokenPool::new()),
        config(),
    );
    let outcome = terminus.discover(&repository, &factory).await;

    assert!(outcome.responsive);
    assert!(!outcome.records_complete);
    assert_eq!(outcome.records_loaded, 1);
    // the partial set is still usable
    assert_eq!(repository.records(ENDPOINT).len(), 1);
    assert_eq!(factory.sensors.lock().unwrap().len(), 1);
}
