use anyhow::Result;

use codelens::config::Config;
use codelens::index::records::{Annotation, Session, TargetType};
use codelens::session::NewAnnotation;

use super::{open_index, print_json, OutputFormat};
use crate::SessionAction;

fn print_session(session: &Session) {
    println!(
        "  #{} {} -> {} ({} change(s)){}",
        session.session_id,
        session.started_at,
        session.ended_at.as_deref().unwrap_or("active"),
        session.change_count,
        session
            .summary
            .as_deref()
            .map(|s| format!(": {}", s))
            .unwrap_or_default()
    );
}

pub async fn session(
    project: String,
    config: Config,
    action: SessionAction,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;

    match action {
        SessionAction::Start { transcript } => {
            let session = index.start_session(transcript.as_deref())?;
            match format {
                OutputFormat::Json => print_json(&session)?,
                OutputFormat::Text => println!("Started session #{}", session.session_id),
            }
        }

        SessionAction::End { summary } => {
            let session = index.end_session(summary.as_deref())?;
            match (format, session) {
                (OutputFormat::Json, session) => print_json(&session)?,
                (OutputFormat::Text, None) => println!("No active session"),
                (OutputFormat::Text, Some(session)) => {
                    println!("Ended session:");
                    print_session(&session);
                }
            }
        }

        SessionAction::Current => {
            let session = index.active_session()?;
            match (format, session) {
                (OutputFormat::Json, session) => print_json(&session)?,
                (OutputFormat::Text, None) => println!("No active session"),
                (OutputFormat::Text, Some(session)) => print_session(&session),
            }
        }

        SessionAction::History { limit } => {
            let sessions = index.session_history(limit)?;
            match format {
                OutputFormat::Json => print_json(&sessions)?,
                OutputFormat::Text if sessions.is_empty() => println!("No sessions yet"),
                OutputFormat::Text => sessions.iter().for_each(print_session),
            }
        }

        SessionAction::Changes { id } => {
            let changes = index.session_changes(id)?;
            match format {
                OutputFormat::Json => print_json(&changes)?,
                OutputFormat::Text => {
                    for change in &changes {
                        println!(
                            "  {} {:<8} {}",
                            change.changed_at,
                            change.change_kind.as_str(),
                            change.path
                        );
                    }
                    println!("\n{} change(s) in session #{}", changes.len(), id);
                }
            }
        }
    }

    Ok(())
}

pub async fn annotate(
    project: String,
    config: Config,
    target: String,
    text: String,
    file: bool,
    author: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let note = NewAnnotation {
        target_type: if file { TargetType::File } else { TargetType::Symbol },
        target_id: target,
        text,
        author,
    };
    let annotation = index.annotate(note)?;

    match format {
        OutputFormat::Json => print_json(&annotation)?,
        OutputFormat::Text => println!(
            "Annotated {} {} (#{})",
            annotation.target_type.as_str(),
            annotation.target_id,
            annotation.annotation_id
        ),
    }

    Ok(())
}

fn print_annotation(note: &Annotation) {
    let state = match &note.orphaned_at {
        Some(at) => format!(" (orphaned {})", at),
        None => String::new(),
    };
    println!(
        "  #{} {} {} [{}] {}{}",
        note.annotation_id,
        note.target_type.as_str(),
        note.target_id,
        note.author,
        note.text,
        state
    );
}

pub async fn annotations(
    project: String,
    config: Config,
    target: String,
    file: bool,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let target_type = if file { TargetType::File } else { TargetType::Symbol };
    let notes = index.annotations(target_type, &target)?;

    match format {
        OutputFormat::Json => print_json(&notes)?,
        OutputFormat::Text if notes.is_empty() => println!("No annotations on {}", target),
        OutputFormat::Text => notes.iter().for_each(print_annotation),
    }

    Ok(())
}

pub async fn orphans(project: String, config: Config, format: OutputFormat) -> Result<()> {
    let index = open_index(&project, config)?;
    let orphaned = index.orphaned_annotations()?;

    match format {
        OutputFormat::Json => print_json(&orphaned)?,
        OutputFormat::Text if orphaned.is_empty() => println!("No orphaned annotations"),
        OutputFormat::Text => orphaned.iter().for_each(print_annotation),
    }

    Ok(())
}
