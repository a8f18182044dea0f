use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use ollama_chat::{ReplyMode, Role};

use crate::app::{App, InputMode, LineEditor};

/// Parse a line of text and convert **bold** markdown to styled spans
fn parse_markdown_line(text: &str, base: Style) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut chars = text.chars().peekable();
    let mut current_text = String::new();

    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'*') {
            // Consume the second *
            chars.next();

            if !current_text.is_empty() {
                spans.push(Span::styled(std::mem::take(&mut current_text), base));
            }

            // Find closing **
            let mut bold_text = String::new();
            let mut found_close = false;
            while let Some(c) = chars.next() {
                if c == '*' && chars.peek() == Some(&'*') {
                    chars.next();
                    found_close = true;
                    break;
                }
                bold_text.push(c);
            }

            if found_close && !bold_text.is_empty() {
                spans.push(Span::styled(bold_text, base.add_modifier(Modifier::BOLD)));
            } else {
                // No closing **, treat as literal
                current_text.push_str("**");
                current_text.push_str(&bold_text);
            }
        } else {
            current_text.push(c);
        }
    }

    if !current_text.is_empty() {
        spans.push(Span::styled(current_text, base));
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, chat, input, footer
    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if app.show_model_picker {
        render_model_picker(app, frame, area);
    } else if app.input_mode == InputMode::Model {
        render_model_input(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let mode = match app.settings.mode {
        ReplyMode::Streaming => "streaming",
        ReplyMode::Atomic => "atomic",
    };

    let title = Line::from(vec![
        Span::styled(" Ollama Chat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("[{} via {}, {}] ", app.model, app.settings.backend.display_name(), mode),
            Style::default().fg(Color::White),
        ),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Store chat area for mouse hit-testing and scroll math (inner size minus borders)
    app.chat_area = Some(area);
    app.chat_height = area.height.saturating_sub(2);
    app.chat_width = area.width.saturating_sub(2);
    if app.follow_bottom {
        app.scroll_to_bottom();
    }

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(format!(" {} ", app.model));

    let chat_text = if app.turns.is_empty() {
        Text::from(Span::styled(
            "Type a message and press Enter...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let mut lines: Vec<Line> = Vec::new();
        let last = app.turns.len() - 1;

        for (i, turn) in app.turns.iter().enumerate() {
            match turn.role() {
                Role::User => {
                    lines.push(Line::from(Span::styled(
                        "You:",
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    )));
                    for line in turn.content().lines() {
                        lines.push(Line::from(line.to_string()));
                    }
                }
                Role::Assistant => {
                    lines.push(Line::from(Span::styled(
                        "AI:",
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    )));
                    if i == last && app.is_thinking() {
                        // Animated ellipsis: cycles through ".", "..", "..."
                        let dots = ".".repeat((app.animation_frame as usize) + 1);
                        lines.push(Line::from(Span::styled(
                            format!("Thinking{}", dots),
                            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
                        )));
                    } else {
                        let base = if App::is_error_turn(turn.content()) {
                            Style::default().fg(Color::Red)
                        } else {
                            Style::default()
                        };
                        for line in turn.content().lines() {
                            lines.push(parse_markdown_line(line, base));
                        }
                    }
                }
                Role::System => {
                    lines.push(Line::from(Span::styled(
                        turn.content().to_string(),
                        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
                    )));
                }
            }
            lines.push(Line::default());
        }

        Text::from(lines)
    };

    let chat = Paragraph::new(chat_text)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let editing = app.input_mode == InputMode::Editing;
    let border_color = if editing { Color::Yellow } else { Color::DarkGray };
    let title = if app.reply_in_flight {
        " Message (waiting for reply) "
    } else {
        " Message "
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    render_line_editor(frame, area, block, &app.input, editing, Color::Cyan);
}

/// Draw a one-line editor with horizontal scrolling that keeps the cursor visible.
fn render_line_editor(
    frame: &mut Frame,
    area: Rect,
    block: Block,
    editor: &LineEditor,
    show_cursor: bool,
    color: Color,
) {
    // Inner width = total width - 2 (for borders)
    let inner_width = area.width.saturating_sub(2) as usize;
    let cursor_pos = editor.cursor;

    let scroll_offset = if inner_width == 0 {
        0
    } else if cursor_pos >= inner_width {
        cursor_pos - inner_width + 1
    } else {
        0
    };

    let visible_text: String = editor
        .text
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(color))
        .block(block);
    frame.render_widget(input, area);

    if show_cursor {
        let cursor_x = (cursor_pos - scroll_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let (mode_text, mode_style) = match app.input_mode {
        InputMode::Normal => (" NORMAL ", Style::default().bg(Color::Blue).fg(Color::White)),
        InputMode::Editing => (" INSERT ", Style::default().bg(Color::Yellow).fg(Color::Black)),
        InputMode::Model => (" MODEL ", Style::default().bg(Color::Magenta).fg(Color::White)),
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let hints = if let Some(status) = &app.status {
        vec![Span::styled(format!(" {} ", status), label_style.fg(Color::Yellow))]
    } else {
        let pairs: &[(&str, &str)] = match app.input_mode {
            InputMode::Normal => &[
                ("i", "type"),
                ("j/k", "scroll"),
                ("c", "clear"),
                ("m", "model"),
                ("M", "installed"),
                ("s", "save model"),
                ("q", "quit"),
            ],
            InputMode::Editing => &[
                ("Enter", "send"),
                ("PgUp/PgDn", "scroll"),
                ("^L", "clear"),
                ("Esc", "stop typing"),
            ],
            InputMode::Model => &[("Enter", "use model"), ("Esc", "cancel")],
        };
        pairs
            .iter()
            .flat_map(|(key, label)| {
                [
                    Span::styled(format!(" {} ", key), key_style),
                    Span::styled(format!(" {} ", label), label_style),
                ]
            })
            .collect()
    };

    let footer_content = Line::from(
        vec![
            Span::styled(mode_text, mode_style),
            Span::styled(" ", label_style),
        ]
        .into_iter()
        .chain(hints)
        .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn render_model_picker(app: &mut App, frame: &mut Frame, area: Rect) {
    // Calculate popup size and position (centered)
    let popup_width = 40.min(area.width.saturating_sub(4));
    let popup_height = (app.available_models.len() as u16 + 2)
        .max(3)
        .min(area.height.saturating_sub(4));

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;
    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Select Model (Enter to select, Esc to cancel) ");

    let items: Vec<ListItem> = app
        .available_models
        .iter()
        .map(|model| {
            let style = if model == &app.model {
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(format!(" {} ", model)).style(style)
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, popup_area, &mut app.model_picker_state);
}

fn render_model_input(app: &App, frame: &mut Frame, area: Rect) {
    let popup_width = 50.min(area.width.saturating_sub(4));
    let popup_height = 3;

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;
    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta))
        .title(" Model name (as shown by `ollama list`) ");

    render_line_editor(frame, popup_area, block, &app.model_input, true, Color::White);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bold_markdown_becomes_styled_span() {
        let line = parse_markdown_line("say **hola** now", Style::default());
        assert_eq!(line.spans.len(), 3);
        assert_eq!(line.spans[1].content, "hola");
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn test_unclosed_bold_is_literal() {
        let line = parse_markdown_line("a **b", Style::default());
        let text: String = line.spans.iter().map(|s| s.content.as_ref()).collect();
        assert_eq!(text, "a **b");
    }
}
