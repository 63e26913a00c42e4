// vim: tw=80
//! The apply loop: decodes action lists, walks a task's events twice
//! (compute-progress, then run), and keeps a short trace of executed
//! actions for failure reports.

use std::path::Path;

use log::{error, info};
use ringbuffer::{
    AllocRingBuffer,
    RingBuffer,
    RingBufferExt,
    RingBufferWrite,
};

use crate::{
    actions::{Action, ActionCtx, ApplyOptions, StreamCtx},
    block_cache::BlockCache,
    errors::{Error, Result},
    manifest::{Manifest, Task},
    progress::Progress,
    resource::ResourceReader,
    MAX_ARGS,
};

/// Trace capacity; must be a power of two.
const TRACE_DEPTH: usize = 64;

/// Decode a flat arity-prefixed action list into typed actions.
pub fn decode_list(funlist: &[String]) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    let mut ix = 0;
    while ix < funlist.len() {
        let argc = funlist[ix]
            .parse::<usize>()
            .ok()
            .filter(|&n| (1..=MAX_ARGS).contains(&n))
            .ok_or_else(|| {
                Error::ActionList(format!(
                    "unexpected arity '{}' in action list",
                    funlist[ix]
                ))
            })?;
        ix += 1;
        if ix + argc > funlist.len() {
            return Err(Error::ActionList(
                "truncated action list".into(),
            ));
        }
        actions.push(Action::parse(&funlist[ix..ix + argc])?);
        ix += argc;
    }
    Ok(actions)
}

/// Creation-time validation of every action list in a task.
pub fn validate_task(manifest: &Manifest, task: &Task) -> Result<()> {
    for action in decode_list(&task.on_init)? {
        action.validate(manifest, None)?;
    }
    for event in &task.on_resource {
        if manifest.file_resource(&event.resource).is_none() {
            return Err(Error::Reference {
                action: "on-resource",
                kind: "file-resource",
                name: event.resource.clone(),
            });
        }
        for action in decode_list(&event.funlist)? {
            action.validate(manifest, Some(event.resource.as_str()))?;
        }
    }
    for action in decode_list(&task.on_finish)? {
        action.validate(manifest, None)?;
    }
    Ok(())
}

/// Validate every task in the manifest without touching any destination.
pub fn check(manifest: &Manifest) -> Result<()> {
    for task in manifest.task.values() {
        validate_task(manifest, task)?;
    }
    Ok(())
}

/// Calculate the field width needed to print step numbers up to this count.
fn field_width(max: usize) -> usize {
    1 + (max as f64).log(10.0) as usize
}

#[allow(clippy::too_many_arguments)]
fn run_actions(
    actions: &[Action],
    manifest: &Manifest,
    output: &mut BlockCache,
    progress: &mut Progress,
    options: ApplyOptions,
    mut resource: Option<(&str, &mut ResourceReader)>,
    trace: &mut AllocRingBuffer<String>,
    step: &mut u64,
    stepwidth: usize,
) -> Result<()> {
    for action in actions {
        *step += 1;
        info!("{:width$} {}", step, action, width = stepwidth);
        trace.push(action.to_string());
        let stream = resource.as_mut().map(|(name, reader)| StreamCtx {
            resource: *name,
            reader: &mut **reader,
        });
        let mut ctx = ActionCtx {
            manifest,
            output: &mut *output,
            progress: &mut *progress,
            options,
            stream,
        };
        action.run(&mut ctx)?;
    }
    Ok(())
}

fn dump_trace(trace: &AllocRingBuffer<String>) {
    if trace.is_empty() {
        return;
    }
    error!("Most recent actions:");
    for line in trace.iter() {
        error!("  {line}");
    }
}

/// Apply one task of the bundle to the destination: validate, pre-compute
/// the progress total, run every event's actions in order, and flush.
pub fn apply(
    manifest: &Manifest,
    bundle: &Path,
    task_name: &str,
    output: &mut BlockCache,
    options: ApplyOptions,
    progress: &mut Progress,
) -> Result<()> {
    let task = manifest.task(task_name)?;
    validate_task(manifest, task)?;

    let on_init = decode_list(&task.on_init)?;
    let on_resource = task
        .on_resource
        .iter()
        .map(|event| {
            decode_list(&event.funlist)
                .map(|actions| (event.resource.as_str(), actions))
        })
        .collect::<Result<Vec<_>>>()?;
    let on_finish = decode_list(&task.on_finish)?;

    for action in &on_init {
        action.compute_progress(manifest, None, progress)?;
    }
    for &(resource, ref actions) in &on_resource {
        for action in actions {
            action.compute_progress(manifest, Some(resource), progress)?;
        }
    }
    for action in &on_finish {
        action.compute_progress(manifest, None, progress)?;
    }

    let total_actions = on_init.len()
        + on_resource.iter().map(|(_, a)| a.len()).sum::<usize>()
        + on_finish.len();
    let stepwidth = field_width(total_actions.max(1));
    let mut trace = AllocRingBuffer::with_capacity(TRACE_DEPTH);
    let mut step = 0u64;

    let result = (|| -> Result<()> {
        run_actions(
            &on_init,
            manifest,
            output,
            progress,
            options,
            None,
            &mut trace,
            &mut step,
            stepwidth,
        )?;
        for &(resource, ref actions) in &on_resource {
            let fr = manifest.file_resource(resource).ok_or_else(|| {
                Error::Reference {
                    action: "on-resource",
                    kind: "file-resource",
                    name: resource.to_string(),
                }
            })?;
            let mut reader =
                ResourceReader::open(bundle, resource, &fr.sparse_map()?)?;
            run_actions(
                actions,
                manifest,
                output,
                progress,
                options,
                Some((resource, &mut reader)),
                &mut trace,
                &mut step,
                stepwidth,
            )?;
        }
        run_actions(
            &on_finish,
            manifest,
            output,
            progress,
            options,
            None,
            &mut trace,
            &mut step,
            stepwidth,
        )?;
        output.flush()?;
        Ok(())
    })();

    if let Err(e) = result {
        dump_trace(&trace);
        return Err(e);
    }
    progress.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn decode_flat_encoding() {
        let actions = decode_list(&strings(&[
            "2",
            "raw_write",
            "10",
            "4",
            "raw_memset",
            "0",
            "1",
            "0xff",
        ]))
        .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], Action::RawWrite { block_offset: 10 });
        assert_eq!(actions[1], Action::RawMemset {
            block_offset: 0,
            block_count: 1,
            value: 0xFF,
        });
    }

    #[test]
    fn decode_rejects_bad_arity() {
        assert!(matches!(
            decode_list(&strings(&["zero", "raw_write", "10"])),
            Err(Error::ActionList(_))
        ));
        assert!(matches!(
            decode_list(&strings(&["0"])),
            Err(Error::ActionList(_))
        ));
        assert!(matches!(
            decode_list(&strings(&["9", "a", "b", "c", "d", "e", "f", "g",
                                   "h", "i"])),
            Err(Error::ActionList(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_lists() {
        assert!(matches!(
            decode_list(&strings(&["3", "fat_rm", "0"])),
            Err(Error::ActionList(_))
        ));
    }

    #[test]
    fn validate_catches_unknown_resources() {
        let manifest = Manifest::parse(
            r#"
            [task.complete]
            [[task.complete.on-resource]]
            resource = "missing"
            funlist = ["2", "raw_write", "0"]
            "#,
        )
        .unwrap();
        let task = manifest.task("complete").unwrap();
        assert!(matches!(
            validate_task(&manifest, task),
            Err(Error::Reference { .. })
        ));
    }

    #[test]
    fn validate_catches_misplaced_file_actions() {
        let manifest = Manifest::parse(
            r#"
            [task.complete]
            on-init = ["2", "raw_write", "0"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            check(&manifest),
            Err(Error::ContextMismatch { .. })
        ));
    }
}
