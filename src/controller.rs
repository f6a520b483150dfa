//! The broker's core state machine (component G): per-address content
//! buffer, priority/ownership arbitration, sequence advancement, periodic
//! refresh, persisted state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::addrmap;
use crate::charset;
use crate::error::ControllerError;
use crate::gpio::StopIndicator;
use crate::model::{BufferEntry, DisplayContent, Snapshot, BROADCAST};
use crate::persistence;
use crate::serial::SerialLink;
use crate::telegram;

/// Default "repaint even if unchanged" interval: displays forget their
/// content, so unchanged text is retransmitted after this many seconds.
pub const DEFAULT_REFRESH_TIMEOUT: f64 = 120.0;
const MAX_TEXT_BYTES: usize = 36;

pub struct Controller {
    buffer: [BufferEntry; 4],
    enabled: [bool; 4],
    stop_indicators: [bool; 4],
    current_text: [Option<String>; 4],
    epoch: Instant,
    refresh_timeout: f64,
    verbose: bool,
    debug: bool,
    serial: Box<dyn SerialLink>,
    gpio: Box<dyn StopIndicator>,
    state_path: PathBuf,
}

fn filter_content(content: &DisplayContent) -> DisplayContent {
    match content {
        DisplayContent::Text { text, duration } => DisplayContent::Text {
            text: charset::ascii_filter(text),
            duration: *duration,
        },
        DisplayContent::Time { format, duration } => DisplayContent::Time {
            format: charset::ascii_filter(format),
            duration: *duration,
        },
        DisplayContent::Sequence { messages, interval } => DisplayContent::Sequence {
            messages: messages.iter().map(filter_content).collect(),
            interval: *interval,
        },
    }
}

fn format_time(fmt: &str) -> String {
    use chrono::format::{Item, StrftimeItems};

    let items: Vec<Item> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        warn!(format = fmt, "invalid strftime format, displaying it literally");
        return fmt.to_string();
    }
    chrono::Local::now().format(fmt).to_string()
}

impl Controller {
    pub fn new(
        serial: Box<dyn SerialLink>,
        gpio: Box<dyn StopIndicator>,
        state_path: PathBuf,
        refresh_timeout: f64,
        verbose: bool,
        debug: bool,
    ) -> Self {
        Self {
            buffer: std::array::from_fn(|_| BufferEntry::default()),
            enabled: [true; 4],
            stop_indicators: [false; 4],
            current_text: [None, None, None, None],
            epoch: Instant::now(),
            refresh_timeout,
            verbose,
            debug,
            serial,
            gpio,
            state_path,
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Best-effort load at startup: buffer entries first (each re-submitted
    /// through `set_message` so arbitration + filtering apply), then stop
    /// indicators, then enabled flags.
    pub async fn restore(&mut self) {
        let snapshot = persistence::load_or_default(&self.state_path);

        let mut buffer_entries = addrmap::from_key_map(&snapshot.buffer);
        buffer_entries.sort_by_key(|(idx, _)| *idx);
        for (idx, entry) in buffer_entries {
            if let Some(content) = entry.content.clone() {
                if let Err(e) = self
                    .set_message(idx as i32, content, entry.priority, entry.owner.clone())
                    .await
                {
                    warn!(error = %e, address = idx, "failed to restore buffer entry");
                }
            }
        }

        let mut stop_entries = addrmap::from_key_map(&snapshot.stop_indicators);
        stop_entries.sort_by_key(|(idx, _)| *idx);
        for (idx, &value) in stop_entries {
            let _ = self.set_stop_indicator(idx as i32, value).await;
        }

        let mut enabled_entries = addrmap::from_key_map(&snapshot.enabled);
        enabled_entries.sort_by_key(|(idx, _)| *idx);
        for (idx, &value) in enabled_entries {
            let _ = self.set_enabled(idx as i32, value).await;
        }

        info!("restored persisted state");
    }

    pub fn get_enabled(&self, address: i32) -> bool {
        if address == BROADCAST {
            self.enabled.iter().all(|&e| e)
        } else if (0..=3).contains(&address) {
            self.enabled[address as usize]
        } else {
            false
        }
    }

    pub fn get_stop_indicator(&self, address: i32) -> bool {
        if (0..=3).contains(&address) {
            self.stop_indicators[address as usize]
        } else {
            false
        }
    }

    /// Enable or disable a display. Broadcasts over all four addresses for
    /// `-1`. Flipping a display from enabled to disabled immediately sends
    /// a blank, outside the refresh loop.
    pub async fn set_enabled(&mut self, address: i32, value: bool) -> Result<bool, ControllerError> {
        if address == BROADCAST {
            for i in 0..4 {
                self.set_enabled_one(i, value).await?;
            }
            return Ok(true);
        }
        if !(0..=3).contains(&address) {
            return Err(ControllerError::InvalidAddress(address));
        }
        self.set_enabled_one(address, value).await
    }

    /// Non-broadcasting core of `set_enabled`: `address` must already be
    /// 0..=3. Split out so the `BROADCAST` loop above doesn't recurse
    /// through the public, potentially-broadcasting entry point.
    async fn set_enabled_one(&mut self, address: i32, value: bool) -> Result<bool, ControllerError> {
        let idx = address as usize;
        let was_enabled = self.enabled[idx];
        self.enabled[idx] = value;

        if was_enabled && !value {
            self.send_text(address, None).await?;
        }

        if self.verbose {
            info!(address, enabled = value, "display power state changed");
        }
        self.save_snapshot_best_effort();
        Ok(true)
    }

    /// Sets a stop indicator. Not defined for the broadcast address at the
    /// wire protocol level; callers broadcast by iterating themselves.
    pub async fn set_stop_indicator(&mut self, address: i32, value: bool) -> Result<bool, ControllerError> {
        if !(0..=3).contains(&address) {
            return Err(ControllerError::InvalidAddress(address));
        }
        let idx = address as usize;
        match self.gpio.set(address, value) {
            Ok(_) => {}
            Err(e) => warn!(error = %e, address, "stop indicator hardware action failed"),
        }
        self.stop_indicators[idx] = value;

        if self.verbose {
            info!(address, value, "stop indicator set");
        }
        self.save_snapshot_best_effort();
        Ok(true)
    }

    /// Sets the content for a display. Rejects the write if the new
    /// priority is strictly lower than the current one and the client
    /// differs from the current owner; equal priority and same-client
    /// writes always win.
    pub async fn set_message(
        &mut self,
        address: i32,
        content: DisplayContent,
        priority: i32,
        client: Option<String>,
    ) -> Result<bool, ControllerError> {
        if !(0..=3).contains(&address) {
            return Err(ControllerError::InvalidAddress(address));
        }
        if !content.is_valid_sequence() {
            return Err(ControllerError::InvalidSequence);
        }

        let idx = address as usize;
        let current_priority = self.buffer[idx].priority;
        let current_owner = self.buffer[idx].owner.clone();

        if priority < current_priority && client != current_owner {
            if self.verbose {
                warn!(
                    address,
                    priority,
                    current_priority,
                    client = ?client,
                    current_owner = ?current_owner,
                    "discarded message: priority too low for a different owner"
                );
            }
            return Ok(false);
        }

        let filtered = filter_content(&content);
        if self.verbose {
            info!(address, priority, client = ?client, "message set");
        }
        self.buffer[idx] = BufferEntry {
            content: Some(filtered),
            priority,
            owner: client,
            cursor: -1,
            last_refresh: 0.0,
            last_update: 0.0,
        };
        self.save_snapshot_best_effort();
        Ok(true)
    }

    /// Pushes a line of text (or a blank, for `None`) to the physical
    /// display, handling address multiplexing and truncation. `-1`
    /// broadcasts to all four addresses. Serial write failures are logged
    /// and otherwise swallowed: the refresh loop will retry on its own.
    pub async fn send_text(&mut self, address: i32, text: Option<&str>) -> Result<(), ControllerError> {
        if address == BROADCAST {
            for i in 0..4 {
                self.send_text_one(i, text).await?;
            }
            return Ok(());
        }
        if !(0..=3).contains(&address) {
            return Err(ControllerError::InvalidAddress(address));
        }
        self.send_text_one(address, text).await
    }

    /// Non-broadcasting core of `send_text`: `address` must already be
    /// 0..=3. Split out so the `BROADCAST` loop above doesn't recurse
    /// through the public, potentially-broadcasting entry point.
    async fn send_text_one(&mut self, address: i32, text: Option<&str>) -> Result<(), ControllerError> {
        let idx = address as usize;

        if !self.enabled[idx] && text.is_some() {
            // A disabled display never receives content on the wire.
            return Ok(());
        }

        let payload: Vec<u8> = match text {
            Some(t) => {
                let mut bytes = charset::transliterate(t);
                bytes.truncate(MAX_TEXT_BYTES);
                bytes
            }
            None => Vec::new(),
        };
        let telegram = telegram::next_stop_short_from_bytes(&payload);

        if self.debug {
            info!(address, telegram = ?telegram, "sending raw telegram");
        }

        match self.serial.write_at(idx as u8, &telegram).await {
            Ok(()) => {
                self.current_text[idx] = if text.is_some() {
                    Some(charset::reverse_transliterate(&payload))
                } else {
                    None
                };
            }
            Err(e) => {
                warn!(error = %e, address, "serial write failed, will retry next tick");
            }
        }
        Ok(())
    }

    /// Runs the core send-or-refresh state machine for one address's
    /// current buffer content.
    pub async fn send_message(&mut self, address: i32) -> Result<(), ControllerError> {
        if !(0..=3).contains(&address) {
            return Err(ControllerError::InvalidAddress(address));
        }
        let idx = address as usize;
        let content = self.buffer[idx].content.clone();
        self.send_content(idx, content.as_ref()).await
    }

    #[async_recursion]
    async fn send_content(&mut self, idx: usize, content: Option<&DisplayContent>) -> Result<(), ControllerError> {
        let now = self.now();
        let address = idx as i32;
        let cur = self.current_text[idx].clone();

        match content {
            None => {
                if cur.is_some() {
                    self.send_text(address, None).await?;
                    self.buffer[idx].last_update = now;
                }
            }
            Some(DisplayContent::Text { text, .. }) => {
                self.push_or_refresh(idx, text, now, cur.as_deref()).await?;
            }
            Some(DisplayContent::Time { format, .. }) => {
                let text = format_time(format);
                self.push_or_refresh(idx, &text, now, cur.as_deref()).await?;
            }
            Some(DisplayContent::Sequence { messages, interval }) => {
                let cursor = self.buffer[idx].cursor;
                let next = if cursor == -1 || cursor as usize >= messages.len() - 1 {
                    0
                } else {
                    (cursor + 1) as usize
                };
                let duration = if cursor >= 0 {
                    messages[cursor as usize].duration().unwrap_or(*interval)
                } else {
                    0.0
                };
                let last_update = self.buffer[idx].last_update;
                let last_refresh = self.buffer[idx].last_refresh;

                if last_update + duration <= now {
                    self.buffer[idx].cursor = next as i32;
                    let next_content = messages[next].clone();
                    self.send_content(idx, Some(&next_content)).await?;
                } else if last_refresh + self.refresh_timeout <= now {
                    self.send_text(address, cur.as_deref()).await?;
                    self.buffer[idx].last_refresh = now;
                }
            }
        }
        Ok(())
    }

    async fn push_or_refresh(
        &mut self,
        idx: usize,
        text: &str,
        now: f64,
        cur: Option<&str>,
    ) -> Result<(), ControllerError> {
        let address = idx as i32;
        if cur != Some(text) {
            self.send_text(address, Some(text)).await?;
            self.buffer[idx].last_refresh = now;
            self.buffer[idx].last_update = now;
        } else if self.buffer[idx].last_refresh + self.refresh_timeout <= now {
            self.send_text(address, Some(text)).await?;
            self.buffer[idx].last_refresh = now;
        }
        Ok(())
    }

    /// One pass of the refresh loop: every enabled address gets a chance
    /// to push or refresh its content.
    pub async fn refresh_tick(&mut self) {
        for address in 0..4i32 {
            if self.enabled[address as usize] {
                if let Err(e) = self.send_message(address).await {
                    warn!(error = %e, address, "refresh tick failed for address");
                }
            }
        }
    }

    /// Diagnostic self-test: blank -> banner -> per-address labels ->
    /// blank, with a few seconds between steps. Not part of the core
    /// contract; purely operational.
    pub async fn selftest(&mut self) {
        let _ = self.send_text(BROADCAST, None).await;
        sleep(Duration::from_secs(2)).await;
        let _ = self.send_text(BROADCAST, Some("IBIS Broker")).await;
        sleep(Duration::from_secs(2)).await;
        let _ = self.send_text(BROADCAST, Some("Self-Test")).await;
        sleep(Duration::from_secs(2)).await;
        for i in 0..4i32 {
            let _ = self.send_text(i, Some(&format!("Display {}", i))).await;
        }
        sleep(Duration::from_secs(5)).await;
        let _ = self.send_text(BROADCAST, None).await;
    }

    pub fn buffer_snapshot(&self) -> BTreeMap<String, BufferEntry> {
        addrmap::to_key_map(&self.buffer)
    }

    pub fn current_text_snapshot(&self) -> BTreeMap<String, Option<String>> {
        addrmap::to_key_map(&self.current_text)
    }

    pub fn enabled_snapshot(&self) -> BTreeMap<String, bool> {
        addrmap::to_key_map(&self.enabled)
    }

    pub fn stop_indicator_snapshot(&self) -> BTreeMap<String, bool> {
        addrmap::to_key_map(&self.stop_indicators)
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            buffer: self.buffer_snapshot(),
            current_text: self.current_text_snapshot(),
            enabled: self.enabled_snapshot(),
            stop_indicators: self.stop_indicator_snapshot(),
        }
    }

    pub fn save_snapshot_best_effort(&self) {
        if let Err(e) = persistence::save(&self.state_path, &self.to_snapshot()) {
            warn!(error = %e, "failed to persist state");
        }
    }
}

/// Drives the refresh task: ticks every 100ms until `shutdown` is set,
/// then flushes one final persistence snapshot. Owns the controller's
/// mutex for the duration of each tick, releasing it during the sleep so
/// the dispatcher can interleave requests.
pub async fn run_refresh_loop(controller: Arc<Mutex<Controller>>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        {
            let mut guard = controller.lock().await;
            guard.refresh_tick().await;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let guard = controller.lock().await;
    guard.save_snapshot_best_effort();
    info!("refresh loop stopped, final snapshot flushed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::NoGpio;
    use crate::serial::{NullSerial, NullSerialHandle};

    fn new_test_controller() -> Controller {
        Controller::new(
            Box::new(NullSerial::new()),
            Box::new(NoGpio),
            PathBuf::from("/tmp/ibis-controller-test-does-not-exist.json"),
            0.1,
            false,
            false,
        )
    }

    fn new_test_controller_with_handle() -> (Controller, NullSerialHandle) {
        let (serial, handle) = NullSerial::with_handle();
        let controller = Controller::new(
            Box::new(serial),
            Box::new(NoGpio),
            PathBuf::from("/tmp/ibis-controller-test-does-not-exist.json"),
            0.1,
            false,
            false,
        );
        (controller, handle)
    }

    #[tokio::test]
    async fn set_message_then_refresh_pushes_text_once() {
        let mut c = new_test_controller();
        c.set_message(
            0,
            DisplayContent::Text {
                text: "Hallo".into(),
                duration: None,
            },
            0,
            Some("c1".into()),
        )
        .await
        .unwrap();
        c.send_message(0).await.unwrap();
        assert_eq!(c.current_text_snapshot().get("0").unwrap().as_deref(), Some("Hallo"));
    }

    #[tokio::test]
    async fn arbitration_rejects_lower_priority_from_different_client() {
        let mut c = new_test_controller();
        c.set_message(
            0,
            DisplayContent::Text {
                text: "first".into(),
                duration: None,
            },
            5,
            Some("c2".into()),
        )
        .await
        .unwrap();

        let accepted = c
            .set_message(
                0,
                DisplayContent::Text {
                    text: "second".into(),
                    duration: None,
                },
                0,
                Some("c1".into()),
            )
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(c.buffer_snapshot().get("0").unwrap().owner.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn same_client_may_always_overwrite_its_own_entry() {
        let mut c = new_test_controller();
        c.set_message(
            0,
            DisplayContent::Text {
                text: "first".into(),
                duration: None,
            },
            5,
            Some("c1".into()),
        )
        .await
        .unwrap();

        let accepted = c
            .set_message(
                0,
                DisplayContent::Text {
                    text: "second".into(),
                    duration: None,
                },
                0,
                Some("c1".into()),
            )
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn disabling_an_enabled_display_sends_a_blank() {
        let mut c = new_test_controller();
        c.set_message(
            0,
            DisplayContent::Text {
                text: "hi".into(),
                duration: None,
            },
            0,
            None,
        )
        .await
        .unwrap();
        c.send_message(0).await.unwrap();
        assert!(c.current_text_snapshot().get("0").unwrap().is_some());

        c.set_enabled(0, false).await.unwrap();
        assert!(c.current_text_snapshot().get("0").unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_timeout_repaints_unchanged_content() {
        let mut c = new_test_controller();
        c.refresh_timeout = 0.0; // force immediate refresh eligibility
        c.set_message(
            0,
            DisplayContent::Text {
                text: "hi".into(),
                duration: None,
            },
            0,
            None,
        )
        .await
        .unwrap();
        c.send_message(0).await.unwrap();
        let first_refresh = c.buffer_snapshot().get("0").unwrap().last_refresh;
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.send_message(0).await.unwrap();
        let second_refresh = c.buffer_snapshot().get("0").unwrap().last_refresh;
        assert!(second_refresh > first_refresh);
    }

    #[tokio::test]
    async fn sequence_advances_through_items_on_each_tick() {
        let mut c = new_test_controller();
        c.set_message(
            0,
            DisplayContent::Sequence {
                messages: vec![
                    DisplayContent::Text {
                        text: "A".into(),
                        duration: None,
                    },
                    DisplayContent::Text {
                        text: "B".into(),
                        duration: None,
                    },
                ],
                interval: 0.0,
            },
            0,
            None,
        )
        .await
        .unwrap();

        c.send_message(0).await.unwrap();
        assert_eq!(c.current_text_snapshot().get("0").unwrap().as_deref(), Some("A"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        c.send_message(0).await.unwrap();
        assert_eq!(c.current_text_snapshot().get("0").unwrap().as_deref(), Some("B"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        c.send_message(0).await.unwrap();
        assert_eq!(c.current_text_snapshot().get("0").unwrap().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn invalid_sequence_is_rejected() {
        let mut c = new_test_controller();
        let result = c
            .set_message(
                0,
                DisplayContent::Sequence {
                    messages: vec![],
                    interval: 1.0,
                },
                0,
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn broadcast_set_enabled_applies_to_all_four() {
        let mut c = new_test_controller();
        c.set_enabled(BROADCAST, false).await.unwrap();
        assert!(!c.get_enabled(BROADCAST));
        for i in 0..4 {
            assert!(!c.get_enabled(i));
        }
    }

    #[tokio::test]
    async fn send_message_writes_a_next_stop_short_telegram_to_the_wire() {
        let (mut c, handle) = new_test_controller_with_handle();
        c.set_message(
            2,
            DisplayContent::Text {
                text: "Hallo \u{00e4}".into(),
                duration: None,
            },
            0,
            None,
        )
        .await
        .unwrap();
        c.send_message(2).await.unwrap();

        let telegram = handle.last(2).expect("address 2 should have received a telegram");
        assert_eq!(&telegram[..2], b"zI");
        assert!(handle.last(0).is_none());
        assert_eq!(handle.history().len(), 1);
    }
}
