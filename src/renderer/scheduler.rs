use std::{cmp::Ordering, ops::Range};

use log::error;

use crate::gfx::Device;

use super::command::{Command, CommandExecutor, CommandMode, ExecutorId, RenderPass};
use super::context::RenderContext;

/// Commands of one pass, laid out in draw order.
#[derive(Debug, Clone, Default)]
pub struct PreparedCommands {
    commands: Vec<Command>,
    solid_range: Range<usize>,
    water_range: Range<usize>,
    trans_range: Range<usize>,
}

impl PreparedCommands {
    /// Keeps the commands of `pass` and orders them solid, water, then
    /// transparent. Transparent commands are sorted by descending camera
    /// distance; the other modes keep their submission order.
    pub fn for_pass(commands: &[Command], pass: RenderPass) -> Self {
        let mut solid = Vec::new();
        let mut water = Vec::new();
        let mut trans = Vec::new();

        for command in commands.iter().filter(|c| c.pass == pass) {
            match command.mode {
                CommandMode::Solid => solid.push(*command),
                CommandMode::Water => water.push(*command),
                CommandMode::Trans => trans.push(*command),
            }
        }

        sort_back_to_front(&mut trans);

        let mut ordered = Vec::with_capacity(solid.len() + water.len() + trans.len());
        let solid_range = append_commands(&mut ordered, solid);
        let water_range = append_commands(&mut ordered, water);
        let trans_range = append_commands(&mut ordered, trans);

        Self {
            commands: ordered,
            solid_range,
            water_range,
            trans_range,
        }
    }

    pub fn all(&self) -> &[Command] {
        &self.commands
    }

    pub fn solid(&self) -> &[Command] {
        &self.commands[self.solid_range.clone()]
    }

    pub fn water(&self) -> &[Command] {
        &self.commands[self.water_range.clone()]
    }

    pub fn trans(&self) -> &[Command] {
        &self.commands[self.trans_range.clone()]
    }

    pub fn count(&self, mode: CommandMode) -> usize {
        match mode {
            CommandMode::Solid => self.solid_range.len(),
            CommandMode::Water => self.water_range.len(),
            CommandMode::Trans => self.trans_range.len(),
        }
    }

    /// Maximal runs of consecutive commands sharing an executor.
    pub fn executor_runs(&self) -> Vec<ExecutorRun> {
        compute_executor_runs(&self.commands)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorRun {
    pub executor: ExecutorId,
    pub range: Range<usize>,
}

/// Per-pass command counts returned by [`CommandScheduler::run_pass`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounts {
    pub solid: usize,
    pub trans: usize,
    pub water: usize,
    pub exec_calls: usize,
    pub failed_execs: usize,
}

impl PassCounts {
    pub fn total(&self) -> usize {
        self.solid + self.trans + self.water
    }
}

/// Collects commands from a set of executors and dispatches them pass by pass.
#[derive(Default)]
pub struct CommandScheduler {
    commands: Vec<Command>,
}

impl CommandScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the four executor phases for `pass`.
    ///
    /// Executors are identified by their position in `executors`. An `exec`
    /// failure is logged and the remaining runs still execute.
    pub fn run_pass(
        &mut self,
        device: &mut dyn Device,
        executors: &mut [&mut dyn CommandExecutor],
        context: &RenderContext,
        pass: RenderPass,
    ) -> PassCounts {
        for executor in executors.iter_mut() {
            executor.start_context(context, pass);
        }

        self.commands.clear();
        for (index, executor) in executors.iter().enumerate() {
            let start = self.commands.len();
            executor.enqueue_commands(&mut self.commands);
            for command in &mut self.commands[start..] {
                command.executor = ExecutorId(index as u16);
            }
        }

        let prepared = PreparedCommands::for_pass(&self.commands, pass);
        let mut counts = PassCounts {
            solid: prepared.count(CommandMode::Solid),
            trans: prepared.count(CommandMode::Trans),
            water: prepared.count(CommandMode::Water),
            ..PassCounts::default()
        };

        for run in prepared.executor_runs() {
            let Some(executor) = executors.get_mut(run.executor.0 as usize) else {
                continue;
            };
            counts.exec_calls += 1;
            if let Err(err) = executor.exec(device, &prepared.all()[run.range.clone()]) {
                counts.failed_execs += 1;
                error!(
                    "Executor {:?} failed during {:?} pass: {}",
                    run.executor, pass, err
                );
            }
        }

        for executor in executors.iter_mut() {
            executor.end_context();
        }

        counts
    }
}

fn sort_back_to_front(commands: &mut [Command]) {
    commands.sort_by(|a, b| b.cam_dist.partial_cmp(&a.cam_dist).unwrap_or(Ordering::Equal));
}

fn append_commands(dest: &mut Vec<Command>, src: Vec<Command>) -> Range<usize> {
    let start = dest.len();
    dest.extend(src);
    start..dest.len()
}

fn compute_executor_runs(commands: &[Command]) -> Vec<ExecutorRun> {
    if commands.is_empty() {
        return Vec::new();
    }

    let mut runs = Vec::new();
    let mut current = commands[0].executor;
    let mut start = 0;

    for (index, command) in commands.iter().enumerate().skip(1) {
        if command.executor != current {
            runs.push(ExecutorRun {
                executor: current,
                range: start..index,
            });
            current = command.executor;
            start = index;
        }
    }

    runs.push(ExecutorRun {
        executor: current,
        range: start..commands.len(),
    });

    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(pass: RenderPass, mode: CommandMode, executor: u16, dist: f32) -> Command {
        let mut command = Command::new(pass, mode, 0, dist);
        command.executor = ExecutorId(executor);
        command
    }

    #[test]
    fn other_passes_are_dropped() {
        let commands = [
            command(RenderPass::Glow, CommandMode::Trans, 0, 1.0),
            command(RenderPass::Lighting, CommandMode::Trans, 0, 2.0),
            command(RenderPass::Lighting, CommandMode::Water, 1, 0.0),
        ];

        let prepared = PreparedCommands::for_pass(&commands, RenderPass::Glow);
        assert_eq!(prepared.all().len(), 1);
        assert_eq!(prepared.all()[0].cam_dist, 1.0);
    }

    #[test]
    fn modes_are_laid_out_solid_water_trans() {
        let commands = [
            command(RenderPass::Lighting, CommandMode::Trans, 0, 5.0),
            command(RenderPass::Lighting, CommandMode::Water, 1, 0.0),
            command(RenderPass::Lighting, CommandMode::Solid, 2, 1.0),
            command(RenderPass::Lighting, CommandMode::Trans, 0, 9.0),
        ];

        let prepared = PreparedCommands::for_pass(&commands, RenderPass::Lighting);
        let modes: Vec<_> = prepared.all().iter().map(|c| c.mode).collect();
        assert_eq!(
            modes,
            vec![
                CommandMode::Solid,
                CommandMode::Water,
                CommandMode::Trans,
                CommandMode::Trans
            ]
        );
        assert_eq!(prepared.trans()[0].cam_dist, 9.0);
        assert_eq!(prepared.solid().len(), 1);
        assert_eq!(prepared.water().len(), 1);
    }

    #[test]
    fn runs_split_on_executor_changes() {
        let commands = [
            command(RenderPass::Lighting, CommandMode::Trans, 0, 9.0),
            command(RenderPass::Lighting, CommandMode::Trans, 0, 8.0),
            command(RenderPass::Lighting, CommandMode::Trans, 1, 7.0),
            command(RenderPass::Lighting, CommandMode::Trans, 0, 6.0),
        ];

        let prepared = PreparedCommands::for_pass(&commands, RenderPass::Lighting);
        let runs = prepared.executor_runs();
        assert_eq!(
            runs,
            vec![
                ExecutorRun {
                    executor: ExecutorId(0),
                    range: 0..2
                },
                ExecutorRun {
                    executor: ExecutorId(1),
                    range: 2..3
                },
                ExecutorRun {
                    executor: ExecutorId(0),
                    range: 3..4
                },
            ]
        );
    }

    #[test]
    fn nan_distances_do_not_panic() {
        let commands = [
            command(RenderPass::Lighting, CommandMode::Trans, 0, f32::NAN),
            command(RenderPass::Lighting, CommandMode::Trans, 0, 1.0),
        ];
        let prepared = PreparedCommands::for_pass(&commands, RenderPass::Lighting);
        assert_eq!(prepared.trans().len(), 2);
    }
}
