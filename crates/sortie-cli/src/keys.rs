use std::io::stdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::{execute, terminal};
use sortie_input::{InputMixer, Key};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Raw-mode keyboard feeding a mixer from its own thread.
///
/// Esc ends the live part of the flight; Ctrl-C (which raw mode keeps from
/// becoming a signal) aborts it. The terminal is restored on drop.
pub struct KeyboardSession {
    done: watch::Receiver<bool>,
    interrupt: watch::Receiver<bool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    enhanced: bool,
}

impl KeyboardSession {
    pub fn start(mixer: Arc<dyn InputMixer>) -> Result<Self> {
        terminal::enable_raw_mode().context("enable raw mode")?;
        // release events only exist with the kitty protocol
        let enhanced = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if enhanced {
            execute!(stdout(), PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES))
                .context("enable key release events")?;
        }

        let (done_tx, done) = watch::channel(false);
        let (interrupt_tx, interrupt) = watch::channel(false);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("keyboard".into())
            .spawn({
                let stop = stop.clone();
                move || {
                    while !stop.load(Ordering::Relaxed) {
                        match event::poll(Duration::from_millis(100)) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                warn!("keyboard: poll failed: {}", e);
                                break;
                            }
                        }
                        let Ok(Event::Key(ev)) = event::read() else { continue };
                        if is_ctrl_c(&ev) {
                            let _ = interrupt_tx.send(true);
                            continue;
                        }
                        let Some(key) = map_key(ev.code) else { continue };
                        if key == Key::Esc {
                            let _ = done_tx.send(true);
                            continue;
                        }
                        match ev.kind {
                            KeyEventKind::Press | KeyEventKind::Repeat => {
                                mixer.press(key);
                                debug!("keyboard: {}", mixer.describe());
                            }
                            KeyEventKind::Release => mixer.release(key),
                        }
                    }
                }
            })
            .context("spawn keyboard thread")?;

        info!("keyboard: ready (release events {})", if enhanced { "on" } else { "off" });
        Ok(Self { done, interrupt, stop, thread: Some(thread), enhanced })
    }

    /// Becomes `true` on Esc.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    /// Becomes `true` on Ctrl-C.
    pub fn interrupt(&self) -> watch::Receiver<bool> {
        self.interrupt.clone()
    }
}

impl Drop for KeyboardSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        if self.enhanced {
            let _ = execute!(stdout(), PopKeyboardEnhancementFlags);
        }
        let _ = terminal::disable_raw_mode();
    }
}

fn is_ctrl_c(ev: &KeyEvent) -> bool {
    ev.modifiers.contains(KeyModifiers::CONTROL) && matches!(ev.code, KeyCode::Char('c') | KeyCode::Char('C'))
}

pub fn map_key(code: KeyCode) -> Option<Key> {
    match code {
        KeyCode::Char(' ') => Some(Key::Space),
        KeyCode::Char(c) => Some(Key::Char(c)),
        KeyCode::Up => Some(Key::Up),
        KeyCode::Down => Some(Key::Down),
        KeyCode::Left => Some(Key::Left),
        KeyCode::Right => Some(Key::Right),
        KeyCode::Esc => Some(Key::Esc),
        _ => None,
    }
}

/// Resolves on SIGINT or when `keys` reads `true`.
pub async fn interrupted(keys: Option<watch::Receiver<bool>>) {
    let from_keys = async move {
        match keys {
            Some(mut rx) => {
                if rx.wait_for(|hit| *hit).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = from_keys => {}
    }
}
