use futures_util::StreamExt;
use ratatui::layout::Rect;
use ratatui::widgets::ListState;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use ollama_chat::{
    validate_input, Config, HttpBackend, ResponseAssembler, Role, Settings, Snapshot, ERROR_MARKER,
};

use crate::tui::AppEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
    /// Typing a model name into the override box
    Model,
}

/// Single-line text field with a character cursor.
#[derive(Debug, Clone, Default)]
pub struct LineEditor {
    pub text: String,
    /// Cursor position in characters, not bytes
    pub cursor: usize,
}

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Rows a line takes when wrapped at `width` characters.
fn wrapped_height(line: &str, width: usize) -> u16 {
    // Use character count, not byte length, for proper UTF-8 handling
    let char_count = line.chars().count();
    let rows = if char_count == 0 { 1 } else { char_count.div_ceil(width.max(1)) };
    u16::try_from(rows).unwrap_or(u16::MAX)
}

impl LineEditor {
    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            cursor: text.chars().count(),
        }
    }

    pub fn insert(&mut self, c: char) {
        let byte_pos = char_to_byte_index(&self.text, self.cursor);
        self.text.insert(byte_pos, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            let byte_pos = char_to_byte_index(&self.text, self.cursor);
            self.text.remove(byte_pos);
        }
    }

    pub fn delete(&mut self) {
        if self.cursor < self.text.chars().count() {
            let byte_pos = char_to_byte_index(&self.text, self.cursor);
            self.text.remove(byte_pos);
        }
    }

    pub fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.text.chars().count());
    }

    pub fn home(&mut self) {
        self.cursor = 0;
    }

    pub fn end(&mut self) {
        self.cursor = self.text.chars().count();
    }

    pub fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.text)
    }
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub settings: Settings,

    // Conversation
    pub assembler: ResponseAssembler,
    pub events: UnboundedSender<AppEvent>,
    pub model: String,
    pub turns: Snapshot,
    pub reply_in_flight: bool,
    pub animation_frame: u8,

    // Input state
    pub input: LineEditor,
    pub model_input: LineEditor,
    pub status: Option<String>,

    // Chat scroll state
    pub chat_scroll: u16,
    pub chat_height: u16,
    pub chat_width: u16,
    pub follow_bottom: bool,
    pub chat_area: Option<Rect>,

    // Model picker
    pub ollama: HttpBackend,
    pub show_model_picker: bool,
    pub model_picker_state: ListState,
    pub available_models: Vec<String>,
}

impl App {
    pub fn new(settings: Settings, assembler: ResponseAssembler, events: UnboundedSender<AppEvent>) -> Self {
        Self {
            should_quit: false,
            input_mode: InputMode::Editing,
            model: settings.model.clone(),
            ollama: HttpBackend::new(&settings.host),
            settings,
            assembler,
            events,
            turns: Vec::new(),
            reply_in_flight: false,
            animation_frame: 0,
            input: LineEditor::default(),
            model_input: LineEditor::default(),
            status: None,
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            follow_bottom: true,
            chat_area: None,
            show_model_picker: false,
            model_picker_state: ListState::default(),
            available_models: Vec::new(),
        }
    }

    /// Send the input line to the model on a background task.
    pub fn submit_message(&mut self) {
        if self.reply_in_flight {
            self.status = Some("Wait for the current reply to finish".to_string());
            return;
        }
        let text = match validate_input(&self.input.text) {
            Ok(text) => text.to_string(),
            Err(_) => {
                self.status = Some("Type a message before sending".to_string());
                return;
            }
        };

        self.input.take();
        self.status = None;
        self.reply_in_flight = true;
        self.follow_bottom = true;

        let replies = self.assembler.handle_user_message(&text, &self.model);
        let tx = self.events.clone();
        tokio::spawn(async move {
            tokio::pin!(replies);
            let mut defect = None;
            while let Some(item) = replies.next().await {
                match item {
                    Ok(snapshot) => {
                        if tx.send(AppEvent::Transcript(snapshot)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "reply assembly aborted");
                        defect = Some(e.to_string());
                        break;
                    }
                }
            }
            let _ = tx.send(AppEvent::ReplyDone(defect));
        });
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.turns = snapshot;
    }

    pub fn finish_reply(&mut self, defect: Option<String>) {
        self.reply_in_flight = false;
        self.animation_frame = 0;
        if let Some(message) = defect {
            self.status = Some(format!("Internal error: {}", message));
        }
    }

    pub fn clear_transcript(&mut self) {
        if self.reply_in_flight || !self.assembler.try_clear() {
            self.status = Some("Can't clear while a reply is in progress".to_string());
            return;
        }
        self.turns.clear();
        self.chat_scroll = 0;
        self.follow_bottom = true;
        self.status = Some("Conversation cleared".to_string());
        info!("conversation cleared");
    }

    /// The placeholder assistant turn is still empty.
    pub fn is_thinking(&self) -> bool {
        self.reply_in_flight
            && self
                .turns
                .last()
                .map(|turn| turn.role() == Role::Assistant && turn.content().is_empty())
                .unwrap_or(true)
    }

    pub fn is_error_turn(content: &str) -> bool {
        content.starts_with(ERROR_MARKER)
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.reply_in_flight {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Estimated rendered height of the transcript at the current width.
    pub fn chat_line_count(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;
        for turn in &self.turns {
            total_lines = total_lines.saturating_add(1); // Role line ("You:" or "AI:")
            let content = if turn.content().is_empty() { " " } else { turn.content() };
            for line in content.lines() {
                total_lines = total_lines.saturating_add(wrapped_height(line, wrap_width));
            }
            total_lines = total_lines.saturating_add(1); // Blank line after message
        }
        total_lines
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.chat_height > 0 { self.chat_height } else { 20 };
        self.chat_line_count().saturating_sub(visible_height)
    }

    pub fn scroll_to_bottom(&mut self) {
        self.chat_scroll = self.max_scroll();
        self.follow_bottom = true;
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
        self.follow_bottom = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let max = self.max_scroll();
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(max);
        self.follow_bottom = self.chat_scroll >= max;
    }

    pub fn half_page(&self) -> u16 {
        (self.chat_height / 2).max(1)
    }

    pub fn begin_model_edit(&mut self) {
        self.model_input = LineEditor::with_text(&self.model);
        self.input_mode = InputMode::Model;
    }

    pub fn apply_model_edit(&mut self) {
        let model = self.model_input.text.trim().to_string();
        if !model.is_empty() {
            self.set_model(model);
        }
        self.input_mode = InputMode::Normal;
    }

    pub fn set_model(&mut self, model: String) {
        info!(%model, "model selected");
        self.status = Some(format!("Model set to {}", model));
        self.model = model;
    }

    pub fn save_model_as_default(&mut self) {
        self.status = Some(match Config::save_default_model(&self.model) {
            Ok(()) => format!("Saved {} as the default model", self.model),
            Err(e) => {
                warn!(error = %e, "failed to save config");
                format!("Could not save config: {}", e)
            }
        });
    }

    /// Open the picker and fetch installed models in the background.
    pub fn open_model_picker(&mut self) {
        self.show_model_picker = true;
        self.status = Some("Loading models...".to_string());

        let ollama = self.ollama.clone();
        let tx = self.events.clone();
        tokio::spawn(async move {
            let models = ollama.list_models().await.map_err(|e| e.to_string());
            let _ = tx.send(AppEvent::ModelsLoaded(models));
        });
    }

    pub fn apply_models(&mut self, models: Result<Vec<String>, String>) {
        match models {
            Ok(models) if models.is_empty() => {
                self.show_model_picker = false;
                self.status = Some("No models found. Pull one with: ollama pull llama3.2".to_string());
            }
            Ok(models) => {
                let selected = models.iter().position(|m| m == &self.model).unwrap_or(0);
                self.available_models = models;
                self.model_picker_state.select(Some(selected));
                self.status = None;
            }
            Err(e) => {
                self.show_model_picker = false;
                self.status = Some(format!("Error listing models: {}", e));
            }
        }
    }

    pub fn model_picker_nav_down(&mut self) {
        let len = self.available_models.len();
        if len > 0 {
            let i = self.model_picker_state.selected().unwrap_or(0);
            self.model_picker_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn model_picker_nav_up(&mut self) {
        let i = self.model_picker_state.selected().unwrap_or(0);
        self.model_picker_state.select(Some(i.saturating_sub(1)));
    }

    pub fn select_picked_model(&mut self) {
        let picked = self
            .model_picker_state
            .selected()
            .and_then(|i| self.available_models.get(i))
            .cloned();
        if let Some(model) = picked {
            self.set_model(model);
        }
        self.show_model_picker = false;
    }
}
