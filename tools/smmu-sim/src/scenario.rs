use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Deserializer, Serialize};
use smmu::{
    AccessType, AddressSpace, CommandEntry, CommandQueueReport, CommandType, EventEntry,
    PagePermissions, Pasid, SecurityState, SharedAddressSpace, SmmuController, SmmuError,
    SmmuStatistics, StreamConfig, StreamId, TranslationResult,
};
use tracing::{debug, info, warn};

/// A 64-bit address written either as a JSON number or as a `"0x..."` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Address(pub u64);

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Address(value)),
            Raw::Text(text) => parse_address(&text)
                .map(Address)
                .map_err(serde::de::Error::custom),
        }
    }
}

fn parse_address(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => trimmed.replace('_', "").parse(),
    };
    parsed.map_err(|err| format!("invalid address {text:?}: {err}"))
}

/// Page permissions written as `"rw-"`-style strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(pub PagePermissions);

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map(Permissions)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Named Stage-2 tables; streams refer to them by name so several can share one.
    #[serde(default)]
    pub stage2_tables: HashMap<String, Vec<MappingSpec>>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("failed to parse scenario")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamSpec {
    pub stream_id: StreamId,
    #[serde(default)]
    pub config: StreamConfig,
    #[serde(default)]
    pub stage2_table: Option<String>,
    #[serde(default)]
    pub pasids: Vec<PasidSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PasidSpec {
    pub pasid: Pasid,
    #[serde(default)]
    pub mappings: Vec<MappingSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MappingSpec {
    pub iova: Address,
    pub pa: Address,
    pub permissions: Permissions,
    #[serde(default)]
    pub security: SecurityState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Translate(TranslateStep),
    Map(MapStep),
    Unmap(UnmapStep),
    EnableStream(StreamRef),
    DisableStream(StreamRef),
    Command(CommandStep),
    ProcessCommands,
    ProcessPri,
    DrainEvents,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TranslateStep {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova: Address,
    #[serde(default = "read_access")]
    pub access: AccessType,
    #[serde(default)]
    pub security: SecurityState,
    #[serde(default)]
    pub expect: Option<Expectation>,
}

fn read_access() -> AccessType {
    AccessType::Read
}

/// What a translation should produce. Unset fields are not checked.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Expectation {
    #[serde(default)]
    pub pa: Option<Address>,
    /// Error variant name, e.g. `"PagePermissionViolation"`.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cache_hit: Option<bool>,
}

impl Expectation {
    /// Describes the first mismatch, if any.
    pub fn check(&self, outcome: &Result<TranslationResult, SmmuError>) -> Option<String> {
        match (outcome, &self.error) {
            (Ok(result), None) => {
                if let Some(Address(pa)) = self.pa {
                    if result.physical_address != pa {
                        return Some(format!(
                            "expected pa {pa:#x}, got {:#x}",
                            result.physical_address
                        ));
                    }
                }
                match self.cache_hit {
                    Some(hit) if hit != result.cache_hit => {
                        Some(format!("expected cacheHit={hit}, got {}", result.cache_hit))
                    }
                    _ => None,
                }
            }
            (Ok(result), Some(kind)) => Some(format!(
                "expected {kind}, translated to {:#x}",
                result.physical_address
            )),
            (Err(err), Some(kind)) if err.kind() == kind.as_str() => None,
            (Err(err), Some(kind)) => Some(format!("expected {kind}, got {}", err.kind())),
            (Err(err), None) => Some(format!("unexpected error: {err}")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MapStep {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova: Address,
    pub pa: Address,
    pub permissions: Permissions,
    #[serde(default)]
    pub security: SecurityState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnmapStep {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamRef {
    pub stream_id: StreamId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommandStep {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub stream_id: StreamId,
    #[serde(default)]
    pub pasid: Pasid,
    #[serde(default)]
    pub start_address: Address,
    #[serde(default)]
    pub end_address: Address,
}

impl From<&CommandStep> for CommandEntry {
    fn from(step: &CommandStep) -> Self {
        CommandEntry::new(step.command_type, step.stream_id, step.pasid)
            .with_range(step.start_address.0, step.end_address.0)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationOutcome {
    pub step: usize,
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova: u64,
    pub access: AccessType,
    pub security: SecurityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_address: Option<u64>,
    pub cache_hit: bool,
    pub bypassed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<String>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub threads: usize,
    pub translations: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub translations: Vec<TranslationOutcome>,
    pub command_reports: Vec<CommandQueueReport>,
    pub pri_responses_queued: usize,
    pub events: Vec<EventEntry>,
    pub failed_expectations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplaySummary>,
    pub statistics: SmmuStatistics,
}

/// Builds the scenario's streams on `smmu`, runs its steps in order, then optionally replays
/// every translation from `threads` threads at once.
pub fn run(smmu: &SmmuController, scenario: &Scenario, threads: usize) -> anyhow::Result<Report> {
    let tables = build_stage2_tables(&scenario.stage2_tables);
    for stream in &scenario.streams {
        configure_stream(smmu, stream, &tables)
            .with_context(|| format!("failed to configure stream {:#x}", stream.stream_id))?;
    }
    info!(
        streams = scenario.streams.len(),
        steps = scenario.steps.len(),
        "scenario configured"
    );

    let mut report = Report {
        scenario: scenario.name.clone(),
        translations: Vec::new(),
        command_reports: Vec::new(),
        pri_responses_queued: 0,
        events: Vec::new(),
        failed_expectations: 0,
        replay: None,
        statistics: SmmuStatistics::default(),
    };

    for (index, step) in scenario.steps.iter().enumerate() {
        run_step(smmu, index, step, &mut report).with_context(|| format!("step {index} failed"))?;
    }

    if threads > 0 {
        report.replay = Some(replay(smmu, &scenario.steps, threads));
    }

    report.events.extend(smmu.process_event_queue());
    report.statistics = smmu.statistics();
    Ok(report)
}

fn build_stage2_tables(specs: &HashMap<String, Vec<MappingSpec>>) -> HashMap<&str, SharedAddressSpace> {
    specs
        .iter()
        .map(|(name, mappings)| {
            let table = AddressSpace::new_shared();
            for m in mappings {
                table.map_page_secure(m.iova.0, m.pa.0, m.permissions.0, m.security);
            }
            (name.as_str(), table)
        })
        .collect()
}

fn configure_stream(
    smmu: &SmmuController,
    spec: &StreamSpec,
    tables: &HashMap<&str, SharedAddressSpace>,
) -> anyhow::Result<()> {
    smmu.configure_stream(spec.stream_id, spec.config)?;
    if let Some(name) = &spec.stage2_table {
        let table = tables
            .get(name.as_str())
            .ok_or_else(|| anyhow!("unknown stage-2 table {name:?}"))?;
        smmu.set_stage2_address_space(spec.stream_id, Some(table.clone()))?;
    }
    for pasid in &spec.pasids {
        smmu.create_stream_pasid(spec.stream_id, pasid.pasid)
            .with_context(|| format!("PASID {:#x}", pasid.pasid))?;
        for m in &pasid.mappings {
            smmu.map_page_secure(
                spec.stream_id,
                pasid.pasid,
                m.iova.0,
                m.pa.0,
                m.permissions.0,
                m.security,
            )
            .with_context(|| format!("mapping {:#x} on PASID {:#x}", m.iova.0, pasid.pasid))?;
        }
    }
    Ok(())
}

fn run_step(
    smmu: &SmmuController,
    index: usize,
    step: &Step,
    report: &mut Report,
) -> anyhow::Result<()> {
    match step {
        Step::Translate(t) => {
            let outcome = smmu.translate_secure(t.stream_id, t.pasid, t.iova.0, t.access, t.security);
            let mismatch = t.expect.as_ref().and_then(|e| e.check(&outcome));
            if let Some(reason) = &mismatch {
                warn!(step = index, %reason, "expectation failed");
                report.failed_expectations += 1;
            }
            report.translations.push(TranslationOutcome {
                step: index,
                stream_id: t.stream_id,
                pasid: t.pasid,
                iova: t.iova.0,
                access: t.access,
                security: t.security,
                physical_address: outcome.as_ref().ok().map(|r| r.physical_address),
                cache_hit: outcome.as_ref().is_ok_and(|r| r.cache_hit),
                bypassed: outcome.as_ref().is_ok_and(|r| r.bypassed),
                error: outcome.as_ref().err().map(ToString::to_string),
                error_kind: outcome.as_ref().err().map(SmmuError::kind),
                mismatch,
            });
        }
        Step::Map(m) => smmu.map_page_secure(
            m.stream_id,
            m.pasid,
            m.iova.0,
            m.pa.0,
            m.permissions.0,
            m.security,
        )?,
        Step::Unmap(u) => {
            if !smmu.unmap_page(u.stream_id, u.pasid, u.iova.0)? {
                debug!(step = index, iova = u.iova.0, "unmap of an unmapped page");
            }
        }
        Step::EnableStream(s) => smmu.enable_stream(s.stream_id)?,
        Step::DisableStream(s) => smmu.disable_stream(s.stream_id)?,
        Step::Command(c) => smmu.submit_command(c.into())?,
        Step::ProcessCommands => report.command_reports.push(smmu.process_command_queue()),
        Step::ProcessPri => report.pri_responses_queued += smmu.process_pri_queue(),
        Step::DrainEvents => report.events.extend(smmu.process_event_queue()),
    }
    Ok(())
}

fn replay(smmu: &SmmuController, steps: &[Step], threads: usize) -> ReplaySummary {
    let translations: Vec<&TranslateStep> = steps
        .iter()
        .filter_map(|step| match step {
            Step::Translate(t) => Some(t),
            _ => None,
        })
        .collect();
    let succeeded = AtomicU64::new(0);
    let failed = AtomicU64::new(0);

    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                for t in &translations {
                    let counter =
                        match smmu.translate_secure(t.stream_id, t.pasid, t.iova.0, t.access, t.security) {
                            Ok(_) => &succeeded,
                            Err(_) => &failed,
                        };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    let summary = ReplaySummary {
        threads,
        translations: (threads * translations.len()) as u64,
        succeeded: succeeded.into_inner(),
        failed: failed.into_inner(),
    };
    info!(?summary, "replay finished");
    summary
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smmu::{FaultMode, SmmuConfiguration};

    const BASIC: &str = r#"{
        "name": "basic",
        "streams": [{
            "streamId": 4096,
            "pasids": [{
                "pasid": 1,
                "mappings": [{ "iova": "0x1000", "pa": "0x4000_0000", "permissions": "rw-" }]
            }]
        }],
        "steps": [
            { "translate": { "streamId": 4096, "pasid": 1, "iova": "0x1234",
                             "expect": { "pa": "0x40000234", "cacheHit": false } } },
            { "translate": { "streamId": 4096, "pasid": 1, "iova": "0x1234",
                             "expect": { "cacheHit": true } } },
            { "translate": { "streamId": 4096, "pasid": 1, "iova": 4660, "access": "execute",
                             "expect": { "error": "PagePermissionViolation" } } },
            { "command": { "type": "TLBI_NH_ALL" } },
            { "command": { "type": "SYNC" } },
            "processCommands"
        ]
    }"#;

    #[test]
    fn addresses_accept_numbers_and_hex() {
        assert_eq!(parse_address("0x4000_0000"), Ok(0x4000_0000));
        assert_eq!(parse_address(" 4096 "), Ok(4096));
        assert!(parse_address("0xzz").is_err());
        let a: Address = serde_json::from_str("\"0X10\"").unwrap();
        assert_eq!(a, Address(0x10));
    }

    #[test]
    fn permissions_parse_from_strings() {
        let p: Permissions = serde_json::from_str("\"r-x\"").unwrap();
        assert_eq!(p.0, PagePermissions::READ | PagePermissions::EXECUTE);
        assert!(serde_json::from_str::<Permissions>("\"rq\"").is_err());
    }

    #[test]
    fn expectation_checks_error_kind_and_pa() {
        let expect = Expectation {
            error: Some("PageNotMapped".into()),
            ..Expectation::default()
        };
        assert_eq!(expect.check(&Err(SmmuError::PageNotMapped { address: 0 })), None);
        assert!(expect
            .check(&Err(SmmuError::StreamDisabled { stream_id: 1 }))
            .is_some());

        let expect = Expectation {
            pa: Some(Address(0x2000)),
            ..Expectation::default()
        };
        let ok = TranslationResult::bypass(0x2000, SecurityState::NonSecure);
        assert_eq!(expect.check(&Ok(ok)), None);
        assert!(expect
            .check(&Ok(TranslationResult::bypass(0x3000, SecurityState::NonSecure)))
            .is_some());
    }

    #[test]
    fn basic_scenario_meets_its_expectations() {
        let scenario = Scenario::from_json_str(BASIC).unwrap();
        let smmu = SmmuController::default();
        let report = run(&smmu, &scenario, 0).unwrap();

        assert_eq!(report.failed_expectations, 0, "{report}");
        assert_eq!(report.translations.len(), 3);
        assert_eq!(report.translations[2].error_kind, Some("PagePermissionViolation"));
        assert_eq!(report.command_reports.len(), 1);
        assert_eq!(report.command_reports[0].syncs_completed, 1);
        assert!(smmu.tlb().is_empty());
        // One permission fault plus the SYNC completion.
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.statistics.total_translations, 3);
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let err = Scenario::from_json_str(r#"{ "steps": [ { "command": { "type": "CMD_SYNC" } } ] }"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("CMD_SYNC"));
    }

    #[test]
    fn failed_expectations_are_counted() {
        let scenario = Scenario::from_json_str(
            r#"{ "steps": [ { "translate": { "streamId": 1, "pasid": 1, "iova": 0,
                                             "expect": { "pa": 0 } } } ] }"#,
        )
        .unwrap();
        let report = run(&SmmuController::default(), &scenario, 0).unwrap();
        assert_eq!(report.failed_expectations, 1);
        assert_eq!(report.translations[0].error_kind, Some("StreamNotConfigured"));
    }

    #[test]
    fn shared_stage2_table_backs_both_streams() {
        let scenario = Scenario::from_json_str(
            r#"{
                "stage2Tables": { "vm0": [
                    { "iova": "0x8000", "pa": "0x9000", "permissions": "rw" }
                ] },
                "streams": [
                    { "streamId": 1, "config": { "stage1Enabled": true, "stage2Enabled": true },
                      "stage2Table": "vm0",
                      "pasids": [{ "pasid": 1, "mappings": [
                          { "iova": "0x1000", "pa": "0x8000", "permissions": "r" } ] }] },
                    { "streamId": 2, "config": { "stage1Enabled": false, "stage2Enabled": true },
                      "stage2Table": "vm0", "pasids": [{ "pasid": 1 }] }
                ],
                "steps": [
                    { "translate": { "streamId": 1, "pasid": 1, "iova": "0x1010",
                                     "expect": { "pa": "0x9010" } } },
                    { "translate": { "streamId": 2, "pasid": 1, "iova": "0x8020",
                                     "access": "write", "expect": { "pa": "0x9020" } } },
                    { "translate": { "streamId": 1, "pasid": 1, "iova": "0x1010",
                                     "access": "write",
                                     "expect": { "error": "PagePermissionViolation" } } }
                ]
            }"#,
        )
        .unwrap();
        let report = run(&SmmuController::default(), &scenario, 0).unwrap();
        assert_eq!(report.failed_expectations, 0, "{report}");
    }

    #[test]
    fn unknown_stage2_table_fails_setup() {
        let scenario = Scenario::from_json_str(
            r#"{ "streams": [ { "streamId": 1, "stage2Table": "missing" } ] }"#,
        )
        .unwrap();
        let err = run(&SmmuController::default(), &scenario, 0).unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn stall_then_pri_response_round_trip() {
        let scenario = Scenario::from_json_str(
            r#"{
                "streams": [{ "streamId": 3, "config": { "faultMode": "stall" },
                              "pasids": [{ "pasid": 1 }] }],
                "steps": [
                    { "translate": { "streamId": 3, "pasid": 1, "iova": "0x5000",
                                     "expect": { "error": "PageNotMapped" } } },
                    { "map": { "streamId": 3, "pasid": 1, "iova": "0x5000",
                               "pa": "0x7000", "permissions": "r" } },
                    "processPri",
                    "processCommands",
                    { "translate": { "streamId": 3, "pasid": 1, "iova": "0x5008",
                                     "expect": { "pa": "0x7008" } } }
                ]
            }"#,
        )
        .unwrap();
        let smmu = SmmuController::default();
        let report = run(&smmu, &scenario, 0).unwrap();
        assert_eq!(report.failed_expectations, 0, "{report}");
        assert_eq!(report.pri_responses_queued, 1);
        assert_eq!(smmu.stalled_transaction_count(), 0);
        assert_eq!(report.statistics.pri_responses, 1);
        assert_eq!(smmu.stream_config(3).unwrap().fault_mode, FaultMode::Stall);
    }

    #[test]
    fn replay_counts_every_translation() {
        let scenario = Scenario::from_json_str(BASIC).unwrap();
        let smmu = SmmuController::new(SmmuConfiguration::high_performance()).unwrap();
        let report = run(&smmu, &scenario, 4).unwrap();
        let replay = report.replay.unwrap();
        assert_eq!(
            replay,
            ReplaySummary {
                threads: 4,
                translations: 12,
                succeeded: 8,
                failed: 4,
            }
        );
        assert_eq!(report.statistics.total_translations, 15);
    }
}
