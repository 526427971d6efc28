//! Terminus discovery
//!
//! When an endpoint is added, the engine walks a fixed capability chain
//! before any event polling starts: supported protocol types, supported
//! commands per type, terminus id, wall-clock push, FRU inventory, event
//! receiver registration, and finally the description-record bulk load.
//! Only the very first query gates responsiveness; later failures degrade
//! the profile but keep the endpoint managed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use termlink_proto::{
    protocol_type, BcdTime, CommandBitmap, DescriptionRecord, EndpointId, LocatorRecord,
    RecordHeader, Request, Response, Tid, TransferOperation, TypeBitmap, COMPLETION_SUCCESS,
    RECORD_HANDLE_END, TID_UNASSIGNED,
};
use termlink_transport::{Correlator, TokenPool};
use tokio::time::timeout;

use crate::config::{EngineConfig, NameDecoration};
use crate::consumers::{ObjectFactory, Repository};

/// One inventory field pulled from the FRU table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FruField {
    pub field_type: u8,
    pub value: String,
}

/// What discovery learned about one endpoint
#[derive(Debug, Clone)]
pub struct TerminusProfile {
    pub endpoint: EndpointId,
    pub tid: Tid,
    pub types: TypeBitmap,
    pub commands: HashMap<u8, CommandBitmap>,
    pub fru_fields: Vec<FruField>,
    /// Valid locator records seen during the record load, by terminus handle
    pub locators: HashMap<u16, LocatorRecord>,
}

impl TerminusProfile {
    fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            tid: TID_UNASSIGNED,
            types: TypeBitmap::default(),
            commands: HashMap::new(),
            fru_fields: Vec::new(),
            locators: HashMap::new(),
        }
    }
}

/// How a discovery run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// The endpoint answered the initial capability query
    pub responsive: bool,
    /// The description-record loop ran to its terminator
    pub records_complete: bool,
    /// Records staged and committed to the repository
    pub records_loaded: usize,
}

impl DiscoveryOutcome {
    fn unresponsive() -> Self {
        Self {
            responsive: false,
            records_complete: false,
            records_loaded: 0,
        }
    }
}

/// Discovery driver for one endpoint
pub struct Terminus {
    endpoint: EndpointId,
    correlator: Arc<dyn Correlator>,
    tokens: Arc<TokenPool>,
    config: EngineConfig,
    decoration: Option<NameDecoration>,
    profile: TerminusProfile,
}

impl Terminus {
    pub fn new(
        endpoint: EndpointId,
        correlator: Arc<dyn Correlator>,
        tokens: Arc<TokenPool>,
        config: EngineConfig,
    ) -> Self {
        Self {
            endpoint,
            correlator,
            tokens,
            config,
            decoration: None,
            profile: TerminusProfile::new(endpoint),
        }
    }

    pub fn with_decoration(mut self, decoration: Option<NameDecoration>) -> Self {
        self.decoration = decoration;
        self
    }

    pub fn profile(&self) -> &TerminusProfile {
        &self.profile
    }

    /// Run the full discovery chain against the endpoint.
    pub async fn discover(
        &mut self,
        repository: &dyn Repository,
        factory: &dyn ObjectFactory,
    ) -> DiscoveryOutcome {
        let Some(types) = self.query_types().await else {
            tracing::warn!(endpoint = self.endpoint, "endpoint unresponsive, discovery aborted");
            return DiscoveryOutcome::unresponsive();
        };
        self.profile.types = types;

        self.query_commands().await;
        self.query_tid().await;

        if types.supports(protocol_type::CONFIG) {
            self.push_wall_clock().await;
        }
        if types.supports(protocol_type::FRU) {
            self.fetch_fru_inventory().await;
        }

        let (records_complete, records_loaded) = if types.supports(protocol_type::PLATFORM) {
            self.register_event_receiver().await;
            self.load_description_records(repository, factory).await
        } else {
            tracing::info!(
                endpoint = self.endpoint,
                "platform protocol unsupported, skipping record load"
            );
            (true, 0)
        };

        DiscoveryOutcome {
            responsive: true,
            records_complete,
            records_loaded,
        }
    }

    async fn query_types(&self) -> Option<TypeBitmap> {
        match self.exchange(Request::QuerySupportedTypes).await? {
            Response::SupportedTypes {
                completion: COMPLETION_SUCCESS,
                types,
            } => Some(types),
            response => {
                self.log_unexpected("supported types", &response);
                None
            }
        }
    }

    async fn query_commands(&mut self) {
        for protocol_type in 0..=protocol_type::MAX {
            if !self.profile.types.supports(protocol_type) {
                continue;
            }
            match self
                .exchange(Request::QuerySupportedCommands { protocol_type })
                .await
            {
                Some(Response::SupportedCommands {
                    completion: COMPLETION_SUCCESS,
                    commands,
                }) => {
                    self.profile.commands.insert(protocol_type, commands);
                }
                Some(response) => self.log_unexpected("supported commands", &response),
                None => {}
            }
        }
    }

    async fn query_tid(&mut self) {
        match self.exchange(Request::QueryTerminusId).await {
            Some(Response::TerminusId {
                completion: COMPLETION_SUCCESS,
                tid,
            }) => {
                tracing::info!(endpoint = self.endpoint, tid, "terminus id assigned");
                self.profile.tid = tid;
            }
            Some(response) => self.log_unexpected("terminus id", &response),
            None => {
                // profile keeps the unassigned tid; naming falls back below
                tracing::warn!(endpoint = self.endpoint, "terminus id query failed");
            }
        }
    }

    async fn push_wall_clock(&self) {
        let epoch = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs(),
            Err(_) => return,
        };
        let time = BcdTime::from_epoch_seconds(epoch);
        match self.exchange(Request::SetDateTime { time }).await {
            Some(Response::DateTimeSet {
                completion: COMPLETION_SUCCESS,
            }) => {}
            Some(response) => self.log_unexpected("set date time", &response),
            None => {}
        }
    }

    async fn fetch_fru_inventory(&mut self) {
        match self.exchange(Request::QueryFruTableMetadata).await {
            Some(Response::FruTableMetadata {
                completion: COMPLETION_SUCCESS,
                total_records,
            }) if total_records > 0 => {}
            Some(Response::FruTableMetadata { .. }) | None => return,
            Some(response) => {
                self.log_unexpected("fru metadata", &response);
                return;
            }
        }

        let mut table = BytesMut::new();
        let mut operation = TransferOperation::FirstPart;
        let mut transfer_handle = 0u32;
        loop {
            let request = Request::FetchFruTable {
                transfer_handle,
                operation,
            };
            match self.exchange(request).await {
                Some(Response::FruTable {
                    completion: COMPLETION_SUCCESS,
                    next_transfer_handle,
                    transfer_flag,
                    table: fragment,
                }) => {
                    table.extend_from_slice(&fragment);
                    if transfer_flag.is_final() {
                        break;
                    }
                    operation = TransferOperation::NextPart;
                    transfer_handle = next_transfer_handle;
                }
                Some(response) => {
                    self.log_unexpected("fru table", &response);
                    return;
                }
                None => return,
            }
        }

        self.profile.fru_fields = parse_fru_table(self.endpoint, table.freeze());
    }

    async fn register_event_receiver(&self) {
        let request = Request::RegisterEventReceiver {
            receiver_endpoint: 0,
            heartbeat_decisecs: self.config.heartbeat_decisecs,
        };
        match self.exchange(request).await {
            Some(Response::EventReceiverRegistered {
                completion: COMPLETION_SUCCESS,
            }) => {
                tracing::info!(endpoint = self.endpoint, "registered as event receiver");
            }
            Some(response) => self.log_unexpected("event receiver registration", &response),
            None => {}
        }
    }

    /// Bulk-load description records. Associations merge into the repository
    /// as they arrive; everything else is staged and committed in one shot
    /// once the loop terminates, so readers never see a half-loaded endpoint.
    async fn load_description_records(
        &mut self,
        repository: &dyn Repository,
        factory: &dyn ObjectFactory,
    ) -> (bool, usize) {
        let mut staged: Vec<(RecordHeader, DescriptionRecord)> = Vec::new();
        let mut complete = false;
        let mut record_handle = RECORD_HANDLE_END;

        loop {
            let Some((next_handle, raw)) = self.fetch_one_record(record_handle).await else {
                break;
            };
            match DescriptionRecord::decode(raw) {
                Ok((header, DescriptionRecord::Association(association))) => {
                    repository.merge_association(self.endpoint, &association);
                    staged.push((header, DescriptionRecord::Association(association)));
                }
                Ok((header, DescriptionRecord::TerminusLocator(locator))) => {
                    if locator.valid {
                        self.profile
                            .locators
                            .insert(locator.terminus_handle, locator.clone());
                        staged.push((header, DescriptionRecord::TerminusLocator(locator)));
                    } else {
                        tracing::warn!(
                            endpoint = self.endpoint,
                            terminus_handle = locator.terminus_handle,
                            "invalid locator record"
                        );
                        repository.invalidate_locator(self.endpoint, locator.terminus_handle);
                    }
                }
                Ok((header, record)) => staged.push((header, record)),
                Err(error) => {
                    tracing::warn!(endpoint = self.endpoint, %error, "undecodable record skipped");
                }
            }
            if next_handle == RECORD_HANDLE_END {
                complete = true;
                break;
            }
            record_handle = next_handle;
        }

        self.materialize(factory, &staged);
        let loaded = staged.len();
        repository.commit(self.endpoint, staged);
        if !complete {
            tracing::warn!(
                endpoint = self.endpoint,
                records = loaded,
                "record load ended early, committed partial set"
            );
        }
        (complete, loaded)
    }

    /// Fetch one record, following its fragment chain. Returns the next
    /// record handle and the reassembled record page.
    async fn fetch_one_record(&self, record_handle: u32) -> Option<(u32, Bytes)> {
        let mut page = BytesMut::new();
        let mut operation = TransferOperation::FirstPart;
        let mut transfer_handle = 0u32;
        loop {
            let request = Request::FetchDescriptionRecord {
                record_handle,
                transfer_handle,
                operation,
            };
            match self.exchange(request).await? {
                Response::DescriptionRecord {
                    completion: COMPLETION_SUCCESS,
                    next_record_handle,
                    next_transfer_handle,
                    transfer_flag,
                    record,
                } => {
                    page.extend_from_slice(&record);
                    if transfer_flag.is_final() {
                        return Some((next_record_handle, page.freeze()));
                    }
                    operation = TransferOperation::NextPart;
                    transfer_handle = next_transfer_handle;
                }
                response => {
                    self.log_unexpected("description record", &response);
                    return None;
                }
            }
        }
    }

    /// Build the application objects the staged records describe.
    fn materialize(&self, factory: &dyn ObjectFactory, staged: &[(RecordHeader, DescriptionRecord)]) {
        // effecter display names arrive in separate name-table records
        let mut effecter_names: HashMap<u16, &str> = HashMap::new();
        for (_, record) in staged {
            if let DescriptionRecord::NameTable(table) = record {
                if let Some(name) = table
                    .names
                    .first()
                    .and_then(|entry| entry.first())
                    .map(|(_, name)| name.as_str())
                {
                    effecter_names.insert(table.effecter_id, name);
                }
            }
        }

        let mut seen_sensors = std::collections::HashSet::new();
        let mut seen_effecters = std::collections::HashSet::new();
        for (_, record) in staged {
            match record {
                DescriptionRecord::CompactSensor(sensor) => {
                    if !seen_sensors.insert(sensor.sensor_id) {
                        tracing::warn!(
                            endpoint = self.endpoint,
                            sensor_id = sensor.sensor_id,
                            "duplicate sensor record skipped"
                        );
                        continue;
                    }
                    let base = sensor
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("Sensor{}", sensor.sensor_id));
                    factory.build_sensor(self.endpoint, &self.decorate(&base), sensor);
                }
                DescriptionRecord::NumericEffecter(effecter) => {
                    if !seen_effecters.insert(effecter.effecter_id) {
                        tracing::warn!(
                            endpoint = self.endpoint,
                            effecter_id = effecter.effecter_id,
                            "duplicate effecter record skipped"
                        );
                        continue;
                    }
                    let base = effecter_names
                        .get(&effecter.effecter_id)
                        .map(|name| (*name).to_string())
                        .unwrap_or_else(|| format!("Effecter{}", effecter.effecter_id));
                    factory.build_effecter(self.endpoint, &self.decorate(&base), effecter);
                }
                _ => {}
            }
        }
    }

    /// Object-path-safe display name: spaces become underscores, then the
    /// endpoint's configured decoration applies, or a terminus-id suffix so
    /// names stay unique across endpoints.
    fn decorate(&self, base: &str) -> String {
        let base = base.replace(' ', "_");
        match &self.decoration {
            Some(decoration) => decoration.apply(&base),
            None => format!("{}_TID{}", base, self.profile.tid),
        }
    }

    async fn exchange(&self, request: Request) -> Option<Response> {
        let token = match self.tokens.next(self.endpoint) {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(endpoint = self.endpoint, %error, "discovery request not sent");
                return None;
            }
        };
        let result = timeout(
            self.config.request_deadline(),
            self.correlator.transfer(self.endpoint, token, request),
        )
        .await;
        let _ = self.tokens.free(self.endpoint, token);
        match result {
            Err(_) => {
                tracing::debug!(endpoint = self.endpoint, "discovery request timed out");
                None
            }
            Ok(Err(error)) => {
                tracing::debug!(endpoint = self.endpoint, %error, "discovery request failed");
                None
            }
            Ok(Ok(response)) => Some(response),
        }
    }

    fn log_unexpected(&self, stage: &str, response: &Response) {
        tracing::warn!(
            endpoint = self.endpoint,
            stage,
            response = ?response,
            "unexpected response during discovery"
        );
    }
}

/// Walk the FRU table's record/field TLV structure. Truncation stops the
/// walk; fields decoded so far are kept.
fn parse_fru_table(endpoint: EndpointId, mut table: Bytes) -> Vec<FruField> {
    let mut fields = Vec::new();
    while table.remaining() >= 4 {
        let _record_set = table.get_u16_le();
        let _record_kind = table.get_u8();
        let field_count = usize::from(table.get_u8());
        // encoding byte follows the record header
        if table.remaining() < 1 {
            break;
        }
        let _encoding = table.get_u8();

        for _ in 0..field_count {
            if table.remaining() < 2 {
                tracing::warn!(endpoint, "fru table truncated mid-record");
                return fields;
            }
            let field_type = table.get_u8();
            let length = usize::from(table.get_u8());
            if table.remaining() < length {
                tracing::warn!(endpoint, field_type, "fru field truncated");
                return fields;
            }
            let raw = table.split_to(length);
            fields.push(FruField {
                field_type,
                value: String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string(),
            });
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn fru_table_fields_decode() {
        let mut table = BytesMut::new();
        table.put_u16_le(1); // record set
        table.put_u8(1); // record kind
        table.put_u8(2); // two fields
        table.put_u8(1); // ASCII encoding
        table.put_u8(3); // field: model
        table.put_u8(4);
        table.put_slice(b"AC01");
        table.put_u8(4); // field: serial
        table.put_u8(6);
        table.put_slice(b"SN1234");

        let fields = parse_fru_table(1, table.freeze());
        assert_eq!(
            fields,
            vec![
                FruField {
                    field_type: 3,
                    value: "AC01".into()
                },
                FruField {
                    field_type: 4,
                    value: "SN1234".into()
                },
            ]
        );
    }

    #[test]
    fn truncated_fru_table_keeps_earlier_fields() {
        let mut table = BytesMut::new();
        table.put_u16_le(1);
        table.put_u8(1);
        table.put_u8(2); // claims two fields
        table.put_u8(1);
        table.put_u8(3);
        table.put_u8(4);
        table.put_slice(b"AC01");
        table.put_u8(4);
        table.put_u8(60); // claims 60 bytes, none follow

        let fields = parse_fru_table(1, table.freeze());
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, "AC01");
    }

    #[test]
    fn empty_fru_table_yields_no_fields() {
        assert!(parse_fru_table(1, Bytes::new()).is_empty());
    }
}
