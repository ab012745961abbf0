//! display — live preview of the annotated stream

use anyhow::{Result, anyhow};
use minifb::{Key, Window, WindowOptions};
use tracing::debug;

use crate::video::RgbFrame;

/// A window showing rendered frames.
pub trait Preview {
    fn show(&mut self, frame: &RgbFrame) -> Result<()>;

    /// Whether the viewer asked to stop.  Never blocks.
    fn interrupt_requested(&mut self) -> bool;

    /// Tear the window down.  Called exactly once by the pipeline.
    fn close(&mut self) -> Result<()>;
}

/// minifb preview window.  `q`, Escape or closing the window request an
/// interrupt.
pub struct PreviewWindow {
    window: Option<Window>,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl PreviewWindow {
    pub fn open(title: &str, width: u32, height: u32) -> Result<Self> {
        let (width, height) = (width as usize, height as usize);
        let mut window = Window::new(title, width, height, WindowOptions::default())
            .map_err(|e| anyhow!("failed to open preview window: {e}"))?;
        // Presentation is paced by the decoder, not the window.
        window.limit_update_rate(None);
        debug!(width, height, "preview window opened");
        Ok(Self {
            window: Some(window),
            buffer: vec![0; width * height],
            width,
            height,
        })
    }
}

impl Preview for PreviewWindow {
    fn show(&mut self, frame: &RgbFrame) -> Result<()> {
        let Some(window) = self.window.as_mut() else {
            return Ok(());
        };
        if (frame.width as usize, frame.height as usize) != (self.width, self.height) {
            return Err(anyhow!(
                "preview is {}x{}, frame is {}x{}",
                self.width,
                self.height,
                frame.width,
                frame.height
            ));
        }
        pack_rgb(&frame.data, &mut self.buffer);
        window
            .update_with_buffer(&self.buffer, self.width, self.height)
            .map_err(|e| anyhow!("preview update failed: {e}"))
    }

    fn interrupt_requested(&mut self) -> bool {
        match self.window.as_ref() {
            Some(w) => !w.is_open() || w.is_key_down(Key::Escape) || w.is_key_down(Key::Q),
            None => true,
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.window.take().is_some() {
            debug!("preview window closed");
        }
        Ok(())
    }
}

/// Packed RGB24 → minifb's 0RGB u32 pixels.
fn pack_rgb(rgb: &[u8], out: &mut [u32]) {
    for (px, dst) in rgb.chunks_exact(3).zip(out.iter_mut()) {
        *dst = (u32::from(px[0]) << 16) | (u32::from(px[1]) << 8) | u32::from(px[2]);
    }
}
