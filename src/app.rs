//! Main application component for Parley

use crate::audio::Analyzer;
use crate::session::{
    ControllerMessage, PipeWirePlatform, SessionConfig, SessionController, SessionStatus,
    UserCommand,
};
use crate::tokio_runtime;
use crate::visual::{VisualFeedbackLoop, VisualFrame};
use gpui::prelude::*;
use gpui::{InteractiveElement, *};
use log::{debug, warn};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

/// Resting diameter of the orb
const ORB_SIZE: f32 = 160.0;

/// The root application view
pub struct VoiceApp {
    commands: mpsc::UnboundedSender<ControllerMessage>,
    status: watch::Receiver<SessionStatus>,
    input_analyzer: Analyzer,
    output_analyzer: Analyzer,
    visual: VisualFeedbackLoop,
    frame: VisualFrame,
    focus_handle: FocusHandle,
    _controller_task: Task<Result<(), tokio::task::JoinError>>,
    _ui_refresh_task: Task<()>,
}

impl VoiceApp {
    pub fn new(
        config: SessionConfig,
        runtime: Handle,
        window: &mut Window,
        cx: &mut Context<Self>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let platform = PipeWirePlatform::new(runtime.clone());
        let controller = SessionController::new(config, platform, tx.clone());

        let status = controller.subscribe();
        let input_analyzer = controller.input_analyzer();
        let output_analyzer = controller.output_analyzer();
        let controller_task = tokio_runtime::spawn(cx, &runtime, controller.run(rx));

        // Spawn a task to drive the orb at ~60fps
        let ui_refresh_task = cx.spawn({
            async move |this: WeakEntity<Self>, cx: &mut AsyncApp| loop {
                cx.background_executor()
                    .timer(Duration::from_millis(16))
                    .await;

                // Upgrade weak reference and advance the animation
                let Some(this) = this.upgrade() else {
                    break;
                };
                let result = cx.update_entity(&this, |app, cx| {
                    app.tick();
                    cx.notify();
                });
                if result.is_err() {
                    break;
                }
            }
        });

        let focus_handle = cx.focus_handle();
        window.focus(&focus_handle);

        Self {
            commands: tx,
            status,
            input_analyzer,
            output_analyzer,
            visual: VisualFeedbackLoop::new(),
            frame: VisualFrame::default(),
            focus_handle,
            _controller_task: controller_task,
            _ui_refresh_task: ui_refresh_task,
        }
    }

    fn tick(&mut self) {
        let status = *self.status.borrow();
        self.frame = self.visual.tick(
            &status,
            Some(&self.input_analyzer),
            Some(&self.output_analyzer),
        );
    }

    fn send(&self, command: UserCommand) {
        debug!("UI command: {:?}", command);
        if self.commands.send(ControllerMessage::Command(command)).is_err() {
            warn!("Session controller is not running");
        }
    }

    /// Tear the session down, then close the window
    fn quit(&self, window: &mut Window) {
        self.send(UserCommand::Shutdown);
        window.remove_window();
    }

    fn render_orb(&self) -> impl IntoElement {
        let frame = self.frame;
        let diameter = ORB_SIZE * frame.scale;
        let glow_alpha = (frame.glow * 160.0) as u32;

        div()
            .size(px(ORB_SIZE * 1.6))
            .flex()
            .items_center()
            .justify_center()
            .child(
                div()
                    .size(px(diameter))
                    .rounded_full()
                    .bg(rgb(frame.color))
                    .border_1()
                    .border_color(rgb(0x2d2d44))
                    .shadow(vec![BoxShadow {
                        color: rgba((frame.color << 8) | glow_alpha).into(),
                        offset: point(px(0.0), px(0.0)),
                        blur_radius: px(24.0 + 48.0 * frame.glow),
                        spread_radius: px(4.0 * frame.glow),
                    }]),
            )
    }
}

impl Drop for VoiceApp {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(ControllerMessage::Command(UserCommand::Shutdown));
    }
}

impl Render for VoiceApp {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let status = *self.status.borrow();
        let is_active = status.is_active();

        div()
            .size_full()
            .flex()
            .flex_col()
            .bg(rgb(0x0f0f1a))
            .track_focus(&self.focus_handle)
            .key_context("Parley")
            .on_key_down(cx.listener(|this, event: &KeyDownEvent, window, _cx| {
                match event.keystroke.key.as_str() {
                    "space" => this.send(UserCommand::Toggle),
                    "escape" => this.send(UserCommand::Disconnect),
                    "q" if event.keystroke.modifiers.control => this.quit(window),
                    _ => {}
                }
            }))
            // Custom titlebar
            .child(
                div()
                    .id("titlebar")
                    .flex()
                    .items_center()
                    .justify_between()
                    .w_full()
                    .h(px(36.0))
                    .bg(rgb(0x12121f))
                    .border_b_1()
                    .border_color(rgb(0x2d2d44))
                    .child(
                        // Window title (left side) - draggable area
                        div()
                            .id("titlebar-drag-area")
                            .flex()
                            .flex_grow()
                            .items_center()
                            .h_full()
                            .px_4()
                            .on_mouse_down(
                                MouseButton::Left,
                                cx.listener(|_this, _event: &MouseDownEvent, window, _cx| {
                                    window.start_window_move();
                                }),
                            )
                            .child(
                                div()
                                    .text_sm()
                                    .font_weight(FontWeight::SEMIBOLD)
                                    .text_color(rgb(0xcccccc))
                                    .child("Parley - Voice Agent"),
                            ),
                    )
                    .child(
                        // Close button (right side) - NOT draggable
                        div()
                            .id("close-button")
                            .w(px(46.0))
                            .h(px(36.0))
                            .flex()
                            .items_center()
                            .justify_center()
                            .cursor_pointer()
                            .hover(|style| style.bg(rgb(0xe81123)))
                            .on_click(cx.listener(|this, _, window, _cx| this.quit(window)))
                            .child(div().text_lg().text_color(rgb(0xcccccc)).child("×")),
                    ),
            )
            .child(
                div()
                    .flex()
                    .flex_col()
                    .flex_grow()
                    .items_center()
                    .justify_center()
                    .gap_6()
                    .bg(rgb(0x16213e))
                    .child(self.render_orb())
                    .child(
                        div()
                            .text_2xl()
                            .font_weight(FontWeight::BOLD)
                            .text_color(rgb(0xffffff))
                            .child(status.label()),
                    )
                    .when_some(status.error, |el, error| {
                        el.child(
                            div()
                                .text_sm()
                                .text_color(rgb(0xe94560))
                                .child(error.label()),
                        )
                    })
                    .child(
                        div()
                            .id("toggle-button")
                            .px_6()
                            .py_2()
                            .rounded_full()
                            .cursor_pointer()
                            .text_color(rgb(0xffffff))
                            .font_weight(FontWeight::SEMIBOLD)
                            .when(is_active, |el| {
                                el.bg(rgb(0x2d2d44))
                                    .hover(|style| style.bg(rgb(0x3d3d5c)))
                            })
                            .when(!is_active, |el| {
                                el.bg(rgb(0xe94560))
                                    .hover(|style| style.bg(rgb(0xff5a75)))
                            })
                            .on_click(cx.listener(|this, _, _window, _cx| {
                                this.send(UserCommand::Toggle);
                            }))
                            .child(if is_active { "Disconnect" } else { "Connect" }),
                    )
                    .child(
                        div()
                            .text_xs()
                            .text_color(rgb(0x666666))
                            .child("Space to connect or disconnect, Ctrl+Q to quit"),
                    ),
            )
    }
}
