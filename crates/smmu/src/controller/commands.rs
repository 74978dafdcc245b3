//! Queue processing: command execution with the SYNC barrier, PRI responses and event delivery.

use std::sync::Arc;

use serde::Serialize;
use smmu_types::{page_base, AccessType, Result, SecurityState, SmmuError, PAGE_SIZE};
use tracing::{debug, trace, warn};

use super::SmmuController;
use crate::queue::{CommandEntry, CommandType, EventEntry, EventSink, EventType, PriEntry};
use crate::sync::{lock, read};
use crate::tlb::TlbEntry;

/// Outcome of one [`SmmuController::process_command_queue`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueueReport {
    /// Non-SYNC commands that completed.
    pub executed: usize,
    /// Commands that could not be applied; they are still consumed.
    pub failed: usize,
    pub syncs_completed: usize,
    /// Processing stopped at a SYNC whose completion event did not fit in the event queue.
    /// The SYNC is still at the head of the command queue.
    pub sync_blocked: bool,
}

impl SmmuController {
    pub fn submit_command(&self, command: CommandEntry) -> Result<()> {
        let _config = read(&self.config);
        self.command_queue.submit(command)?;
        trace!(command_type = ?command.command_type, "command queued");
        Ok(())
    }

    /// Executes queued commands in FIFO order until the queue is empty.
    ///
    /// A SYNC completes once every command ahead of it has run: it appends a
    /// `COMMAND_SYNC_COMPLETION` event and processing continues. Commands submitted while
    /// processing runs are picked up by the same call.
    pub fn process_command_queue(&self) -> CommandQueueReport {
        let config = read(&self.config);
        let _processing = lock(&self.command_processing);
        let caching = config.cache.enable_caching;
        let mut report = CommandQueueReport::default();

        while let Some(command) = self.command_queue.front() {
            if command.is_sync() {
                let completion = EventEntry::new(EventType::CommandSyncCompletion, 0, 0, 0);
                if self.event_queue.submit(completion).is_err() {
                    warn!("event queue full, SYNC left pending");
                    report.sync_blocked = true;
                    break;
                }
                self.counters.sync_completed();
                report.syncs_completed += 1;
            } else {
                match self.execute_command(&command, caching) {
                    Ok(()) => report.executed += 1,
                    Err(err) => {
                        debug!(?command, error = %err, "command failed");
                        self.counters.command_failed();
                        self.emit(EventEntry::new(
                            EventType::ConfigurationError,
                            command.stream_id,
                            command.pasid,
                            command.start_address,
                        ));
                        report.failed += 1;
                    }
                }
            }
            self.command_queue.pop_front();
            self.counters.command_processed();
        }

        if report != CommandQueueReport::default() {
            debug!(?report, "command queue processed");
        }
        report
    }

    fn execute_command(&self, command: &CommandEntry, caching: bool) -> Result<()> {
        let stream = if command.command_type.targets_stream() {
            Some(self.stream(command.stream_id)?)
        } else {
            None
        };
        let (stream_id, pasid) = (command.stream_id, command.pasid);
        let (start, end) = (command.start_address, command.end_address);

        match command.command_type {
            CommandType::TlbiNhAll | CommandType::TlbiEl2All | CommandType::CfgiAll => {
                self.tlb.invalidate_all();
            }
            CommandType::TlbiS12Vmall | CommandType::CfgiSte => {
                self.tlb.invalidate_stream(stream_id);
            }
            CommandType::TlbiNhAsid => {
                self.tlb.invalidate_pasid(stream_id, pasid);
            }
            CommandType::TlbiNhVa => {
                self.tlb.invalidate_range(stream_id, pasid, start, end);
            }
            CommandType::AtcInv => {
                self.tlb.invalidate_range(stream_id, pasid, start, end);
                self.emit(EventEntry::new(
                    EventType::AtcInvalidateCompletion,
                    stream_id,
                    pasid,
                    start,
                ));
            }
            CommandType::PrefetchConfig => {}
            CommandType::PrefetchAddr => {
                let Some(stream) = stream else {
                    return Err(SmmuError::InternalError(
                        "prefetch without stream context".into(),
                    ));
                };
                if caching {
                    let epoch = self.tlb.epoch();
                    // Prefetch is a hint; a walk that would fault is ignored.
                    if let Ok(result) =
                        stream.walk(pasid, start, AccessType::Read, SecurityState::NonSecure)
                    {
                        if !result.bypassed {
                            let entry = TlbEntry::from_translation(stream_id, pasid, start, &result);
                            self.tlb.insert_if_current(entry, epoch);
                        }
                    }
                }
            }
            CommandType::PriResp => {
                let page = page_base(start);
                let resumed = self.stalls.resume(stream_id, pasid, page, page + PAGE_SIZE);
                self.counters.pri_responded();
                self.counters.stalls_resumed(resumed);
            }
            CommandType::Resume => {
                let resumed = self.stalls.resume(stream_id, pasid, start, end);
                self.counters.stalls_resumed(resumed);
            }
            CommandType::Sync => {}
        }
        Ok(())
    }

    pub fn clear_command_queue(&self) -> usize {
        let _processing = lock(&self.command_processing);
        self.command_queue.clear()
    }

    /// Queues a page request from outside the translation path.
    pub fn submit_page_request(&self, entry: PriEntry) -> Result<()> {
        let _config = read(&self.config);
        self.pri_queue.submit(entry)?;
        self.counters.pri_submitted();
        Ok(())
    }

    /// Answers queued page requests with `PRI_RESP` commands, oldest first. Stops at the first
    /// request whose response does not fit in the command queue; that request and everything
    /// behind it stay queued for a later call. Returns how many requests were answered.
    pub fn process_pri_queue(&self) -> usize {
        let _config = read(&self.config);
        let answered = self.pri_queue.drain_while(|request| {
            self.command_queue
                .submit(CommandEntry::pri_resp(
                    request.stream_id,
                    request.pasid,
                    request.requested_address,
                ))
                .is_ok()
        });
        if answered > 0 {
            debug!(answered, remaining = self.pri_queue.len(), "page requests answered");
        }
        answered
    }

    /// Discards queued page requests without answering them. The transactions stalled on
    /// those pages are terminated. Returns how many requests were discarded.
    pub fn clear_pri_queue(&self) -> usize {
        let _config = read(&self.config);
        let discarded = self.pri_queue.drain();
        let terminated: usize = discarded
            .iter()
            .map(|request| {
                let page = page_base(request.requested_address);
                self.stalls
                    .resume(request.stream_id, request.pasid, page, page + PAGE_SIZE)
            })
            .sum();
        self.counters.stalls_terminated(terminated);
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), terminated, "page requests discarded");
        }
        discarded.len()
    }

    /// Queued events, oldest first, without consuming them.
    pub fn events(&self) -> Vec<EventEntry> {
        self.event_queue.events()
    }

    pub fn clear_events(&self) -> usize {
        self.event_queue.clear()
    }

    /// Drains the event queue, handing each event in order to every registered sink.
    pub fn process_event_queue(&self) -> Vec<EventEntry> {
        let events = self.event_queue.drain();
        // Sinks may register further sinks while delivering.
        let sinks: Vec<Arc<dyn EventSink>> = read(&self.sinks).clone();
        for event in &events {
            for sink in sinks.iter() {
                sink.deliver(event);
            }
        }
        events
    }
}
