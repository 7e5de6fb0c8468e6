use anima_render::error::RenderError;
use anima_render::gfx::{Device, RecordingDevice};
use anima_render::renderer::{
    Command, CommandExecutor, CommandMode, CommandScheduler, PreparedCommands, RenderContext,
    RenderPass,
};
use glam::Mat4;
use proptest::prelude::*;

fn pass_strategy() -> impl Strategy<Value = RenderPass> {
    prop::sample::select(RenderPass::ALL.to_vec())
}

fn command_strategy() -> impl Strategy<Value = (RenderPass, CommandMode, f32)> {
    (
        pass_strategy(),
        prop::sample::select(CommandMode::ALL.to_vec()),
        -100.0_f32..100.0,
    )
}

proptest! {
    #[test]
    fn prepared_commands_keep_only_their_pass(
        commands in prop::collection::vec(command_strategy(), 0..64),
        pass in pass_strategy(),
    ) {
        let commands = indexed(commands);
        let prepared = PreparedCommands::for_pass(&commands, pass);
        prop_assert!(prepared.all().iter().all(|command| command.pass == pass));
        prop_assert_eq!(
            prepared.all().len(),
            commands.iter().filter(|command| command.pass == pass).count()
        );
    }

    #[test]
    fn modes_run_solid_then_water_then_trans(
        commands in prop::collection::vec(command_strategy(), 0..64),
        pass in pass_strategy(),
    ) {
        let commands = indexed(commands);
        let prepared = PreparedCommands::for_pass(&commands, pass);
        let ranks: Vec<_> = prepared.all().iter().map(|command| command.mode.draw_order()).collect();
        prop_assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn transparent_commands_go_back_to_front(
        commands in prop::collection::vec(command_strategy(), 0..64),
        pass in pass_strategy(),
    ) {
        let commands = indexed(commands);
        let prepared = PreparedCommands::for_pass(&commands, pass);
        let distances: Vec<_> = prepared.trans().iter().map(|command| command.cam_dist).collect();
        prop_assert!(distances.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn solid_commands_keep_submission_order(
        commands in prop::collection::vec(command_strategy(), 0..64),
        pass in pass_strategy(),
    ) {
        let commands = indexed(commands);
        let prepared = PreparedCommands::for_pass(&commands, pass);
        let submitted: Vec<_> = commands
            .iter()
            .filter(|command| command.pass == pass && command.mode == CommandMode::Solid)
            .map(|command| command.data_index)
            .collect();
        let scheduled: Vec<_> = prepared.solid().iter().map(|command| command.data_index).collect();
        prop_assert_eq!(submitted, scheduled);
    }
}

fn indexed(specs: Vec<(RenderPass, CommandMode, f32)>) -> Vec<Command> {
    specs
        .into_iter()
        .enumerate()
        .map(|(index, (pass, mode, dist))| Command::new(pass, mode, index, dist))
        .collect()
}

/// Executor emitting fixed lighting commands and remembering what it was given.
#[derive(Default)]
struct FakeExecutor {
    commands: Vec<(CommandMode, f32)>,
    fail: bool,
    started: Vec<RenderPass>,
    executed: Vec<Vec<usize>>,
    ended: usize,
}

impl FakeExecutor {
    fn new(commands: &[(CommandMode, f32)]) -> Self {
        Self {
            commands: commands.to_vec(),
            ..Self::default()
        }
    }
}

impl CommandExecutor for FakeExecutor {
    fn start_context(&mut self, _context: &RenderContext, pass: RenderPass) {
        self.started.push(pass);
    }

    fn enqueue_commands(&self, commands: &mut Vec<Command>) {
        for (index, (mode, dist)) in self.commands.iter().enumerate() {
            commands.push(Command::new(RenderPass::Lighting, *mode, index, *dist));
        }
    }

    fn exec(&mut self, _device: &mut dyn Device, commands: &[Command]) -> Result<(), RenderError> {
        self.executed.push(commands.iter().map(|command| command.data_index).collect());
        if self.fail {
            return Err(RenderError::InvariantViolation("executor failure".to_string()));
        }
        Ok(())
    }

    fn end_context(&mut self) {
        self.ended += 1;
    }
}

fn context() -> RenderContext {
    RenderContext::new(Mat4::IDENTITY, Mat4::IDENTITY)
}

#[test]
fn interleaved_transparent_commands_split_executor_runs() {
    let mut scheduler = CommandScheduler::new();
    let mut device = RecordingDevice::new();
    let mut near_and_far = FakeExecutor::new(&[(CommandMode::Trans, 10.0), (CommandMode::Trans, 2.0)]);
    let mut middle = FakeExecutor::new(&[(CommandMode::Trans, 5.0)]);

    let counts = {
        let mut executors: [&mut dyn CommandExecutor; 2] = [&mut near_and_far, &mut middle];
        scheduler.run_pass(&mut device, &mut executors, &context(), RenderPass::Lighting)
    };

    assert_eq!(counts.trans, 3);
    assert_eq!(counts.exec_calls, 3);
    assert_eq!(near_and_far.executed, vec![vec![0], vec![1]]);
    assert_eq!(middle.executed, vec![vec![0]]);
    assert_eq!((near_and_far.ended, middle.ended), (1, 1));
}

#[test]
fn consecutive_commands_of_one_executor_share_a_call() {
    let mut scheduler = CommandScheduler::new();
    let mut device = RecordingDevice::new();
    let mut executor = FakeExecutor::new(&[
        (CommandMode::Solid, 0.0),
        (CommandMode::Solid, 0.0),
        (CommandMode::Water, 0.0),
    ]);

    let counts = {
        let mut executors: [&mut dyn CommandExecutor; 1] = [&mut executor];
        scheduler.run_pass(&mut device, &mut executors, &context(), RenderPass::Lighting)
    };

    assert_eq!(counts.exec_calls, 1);
    assert_eq!(executor.executed, vec![vec![0, 1, 2]]);
}

#[test]
fn a_failing_executor_does_not_stop_the_pass() {
    let mut scheduler = CommandScheduler::new();
    let mut device = RecordingDevice::new();
    let mut broken = FakeExecutor::new(&[(CommandMode::Solid, 0.0)]);
    broken.fail = true;
    let mut healthy = FakeExecutor::new(&[(CommandMode::Trans, 1.0)]);

    let counts = {
        let mut executors: [&mut dyn CommandExecutor; 2] = [&mut broken, &mut healthy];
        scheduler.run_pass(&mut device, &mut executors, &context(), RenderPass::Lighting)
    };

    assert_eq!(counts.failed_execs, 1);
    assert_eq!(healthy.executed, vec![vec![0]]);
    assert_eq!(healthy.ended, 1);
}

#[test]
fn other_passes_start_and_end_without_exec() {
    let mut scheduler = CommandScheduler::new();
    let mut device = RecordingDevice::new();
    let mut executor = FakeExecutor::new(&[(CommandMode::Trans, 1.0)]);

    let counts = {
        let mut executors: [&mut dyn CommandExecutor; 1] = [&mut executor];
        scheduler.run_pass(&mut device, &mut executors, &context(), RenderPass::Glow)
    };

    assert_eq!(counts.total(), 0);
    assert_eq!(executor.started, [RenderPass::Glow]);
    assert!(executor.executed.is_empty());
    assert_eq!(executor.ended, 1);
}
