//! Measure command implementation.

use anyhow::{Context as _, Result, bail};
use roastlink_core::{
    ConnectionManager, DeviceEvent, DeviceInfoReader, Error as CoreError, MeasurementSession,
    PersistenceGateway,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::cli::{MeasureArgs, OutputFormat};
use crate::commands::Context;
use crate::format::{
    FormatOptions, SessionSummary, format_reading_text, format_save_outcome_text,
    format_session_text,
};
use crate::style;
use crate::util::{connect, open_gateway, open_manager, write_output};

pub async fn cmd_measure(ctx: &Context<'_>, args: MeasureArgs) -> Result<()> {
    let gateway = if args.no_save {
        None
    } else {
        Some(open_gateway(ctx.config)?)
    };
    let session_config = ctx.config.session_config(args.measurement_timeout)?;

    let manager = open_manager(ctx.config, args.device.timeout).await?;
    let result = run(ctx, &args, &manager, gateway.as_ref(), session_config).await;

    if let Some(path) = &args.debug_log {
        match manager.debug_log().write_to(path) {
            Ok(()) => tracing::info!("Debug log written to {}", path.display()),
            Err(e) => tracing::warn!("Could not write debug log to {}: {}", path.display(), e),
        }
    }
    manager.disconnect().await.ok();
    result
}

async fn run(
    ctx: &Context<'_>,
    args: &MeasureArgs,
    manager: &ConnectionManager,
    gateway: Option<&PersistenceGateway>,
    session_config: roastlink_core::SessionConfig,
) -> Result<()> {
    let text = matches!(args.format, OutputFormat::Text);
    connect(
        manager,
        ctx.config,
        ctx.config_path,
        args.device.device.clone(),
        !ctx.quiet && text,
    )
    .await?;

    // Info is stamped on the saved measurement; a partial read is fine.
    match DeviceInfoReader::new(manager.clone()).read_if_needed().await {
        Ok(report) => {
            for (field, err) in &report.failures {
                tracing::warn!("Could not read {}: {}", field, err);
            }
        }
        Err(e) => tracing::warn!("Could not read analyzer info: {}", e),
    }

    let session = MeasurementSession::new(manager.clone(), session_config);
    let progress_stop = CancellationToken::new();
    let progress = (!ctx.quiet).then(|| {
        tokio::spawn(show_progress(
            manager.clone(),
            ctx.opts,
            progress_stop.clone(),
        ))
    });

    let measurement = session.measure(args.coffee_type.into(), args.link());
    tokio::pin!(measurement);
    let result = tokio::select! {
        result = &mut measurement => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling measurement...");
            session.cancel().await;
            measurement.await
        }
    };

    progress_stop.cancel();
    if let Some(handle) = progress {
        handle.await.ok();
    }

    let state = match result {
        Ok(state) => state,
        Err(CoreError::Cancelled) => bail!("Measurement cancelled"),
        Err(e) => {
            if let Some(state) = session.snapshot()
                && !ctx.quiet
            {
                eprint!("{}", format_session_text(&state, &ctx.opts));
            }
            return Err(e).context("Measurement failed");
        }
    };

    let outcome = match gateway {
        Some(gateway) => {
            let outcome = gateway
                .save(&state, args.link())
                .await
                .context("Failed to save measurement")?;
            Some(outcome)
        }
        None => None,
    };

    let content = match args.format {
        OutputFormat::Json => ctx.opts.as_json(&SessionSummary::new(&state, outcome.as_ref()))?,
        OutputFormat::Text => {
            let mut content = format_session_text(&state, &ctx.opts);
            if let Some(outcome) = &outcome {
                content.push_str(&format_save_outcome_text(outcome));
            }
            content
        }
    };
    write_output(ctx.output, &content)?;

    // Earlier offline measurements ride along once the backend is reachable.
    if let Some(gateway) = gateway
        && outcome.as_ref().is_some_and(|o| o.is_saved())
    {
        let report = gateway.flush_queue().await;
        if report.submitted + report.duplicates > 0 {
            tracing::info!(
                "Uploaded {} queued measurement(s)",
                report.submitted + report.duplicates
            );
        }
    }
    Ok(())
}

/// Print phase changes and incoming values until `stop` fires.
async fn show_progress(manager: ConnectionManager, opts: FormatOptions, stop: CancellationToken) {
    let mut events = manager.events().subscribe();
    let spinner = style::spinner("Waiting for the analyzer...");
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(DeviceEvent::PhaseChanged { phase, .. }) => {
                spinner.set_message(format!(
                    "Measuring: {}",
                    style::format_phase_colored(phase, opts.no_color)
                ));
            }
            Ok(DeviceEvent::Reading { reading, .. }) => {
                let line = format_reading_text(&reading, &opts);
                style::print_suspended(Some(&spinner), line.trim_end());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::debug!("Progress display skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
    spinner.finish_and_clear();
}
