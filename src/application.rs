use rtx_anim::Result;
use winit::{
    event::{Event, StartCause, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
};

pub trait ApplicationDelegate {
    fn application_will_start(&mut self, target: &EventLoopWindowTarget<()>) -> Result<()>;
    /// Called once per pass of the event loop while the application runs.
    fn application_will_update(&mut self, target: &EventLoopWindowTarget<()>) -> Result<()>;
    fn application_will_quit(&mut self, target: &EventLoopWindowTarget<()>);
}

pub struct Application {
    name: String,
    delegate: Box<dyn ApplicationDelegate>,
    running: bool,
}

impl Application {
    pub fn new(name: &str, delegate: Box<dyn ApplicationDelegate>) -> Self {
        Self {
            name: name.to_string(),
            delegate,
            running: false,
        }
    }

    /// Runs until the window closes or the delegate fails. A failure exits with code 1.
    pub fn run(mut self) -> ! {
        let event_loop = EventLoop::new();
        tracing::info!(name = %self.name, "application starting");

        event_loop.run(move |event, target, control_flow| {
            *control_flow = ControlFlow::Poll;

            match event {
                Event::NewEvents(StartCause::Init) => {
                    if let Err(error) = self.delegate.application_will_start(target) {
                        tracing::error!(%error, "startup failed");
                        *control_flow = ControlFlow::ExitWithCode(1);
                        return;
                    }
                    self.running = true;
                }
                Event::WindowEvent {
                    event: WindowEvent::CloseRequested,
                    ..
                } => {
                    self.running = false;
                    *control_flow = ControlFlow::Exit;
                }
                Event::MainEventsCleared if self.running => {
                    if let Err(error) = self.delegate.application_will_update(target) {
                        tracing::error!(%error, "frame failed");
                        self.running = false;
                        *control_flow = ControlFlow::ExitWithCode(1);
                    }
                }
                Event::LoopDestroyed => {
                    self.delegate.application_will_quit(target);
                    tracing::info!(name = %self.name, "application stopped");
                }
                _ => (),
            }
        })
    }
}
