//! Presenters put a finished overlay buffer on screen.
//!
//! A presenter is created on, and only touched from, the overlay thread.

use image::RgbaImage;
use tracing::warn;

pub trait Presenter {
    fn show(&mut self);
    fn present(&mut self, buffer: &RgbaImage);
    /// Re-applies topmost, no-activate ordering.
    fn raise(&mut self);
    /// Services pending window-system messages.
    fn pump(&mut self) {}
    fn close(&mut self);
}

/// Keeps buffer semantics without a visible window.
#[derive(Debug, Default)]
pub struct HeadlessPresenter;

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self
    }
}

impl Presenter for HeadlessPresenter {
    fn show(&mut self) {}
    fn present(&mut self, _buffer: &RgbaImage) {}
    fn raise(&mut self) {}
    fn close(&mut self) {}
}

/// Layered window on Windows, headless elsewhere.
pub fn platform_presenter(width: u32, height: u32) -> Box<dyn Presenter> {
    #[cfg(windows)]
    {
        if let Some(window) = layered::LayeredWindow::create(width, height) {
            return Box::new(window);
        }
        warn!("unable to create layered overlay window; overlay will not be displayed");
    }
    #[cfg(not(windows))]
    {
        let _ = (width, height);
        warn!("no overlay window on this platform; annotations only appear in captured frames");
    }
    Box::new(HeadlessPresenter::new())
}

#[cfg(windows)]
mod layered {
    use std::mem;
    use std::ptr;
    use std::sync::Once;

    use image::RgbaImage;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{COLORREF, HWND, LPARAM, LRESULT, POINT, SIZE, WPARAM};
    use windows::Win32::Graphics::Gdi::{
        CreateCompatibleDC, CreateDIBSection, DeleteDC, DeleteObject, SelectObject, AC_SRC_ALPHA,
        AC_SRC_OVER, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, BLENDFUNCTION, DIB_RGB_COLORS, HBITMAP,
        HDC, HGDIOBJ,
    };
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, PeekMessageW,
        RegisterClassW, SetWindowPos, TranslateMessage, UpdateLayeredWindow, HWND_TOPMOST, MSG,
        PM_REMOVE, SWP_NOACTIVATE, SWP_NOMOVE, SWP_NOSIZE, SWP_SHOWWINDOW, ULW_ALPHA,
        WINDOW_EX_STYLE, WINDOW_STYLE, WNDCLASSW, WS_EX_LAYERED, WS_EX_NOACTIVATE,
        WS_EX_TOOLWINDOW, WS_EX_TOPMOST, WS_EX_TRANSPARENT, WS_POPUP,
    };

    use super::Presenter;

    fn widestring(value: &str) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        std::ffi::OsStr::new(value)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    pub fn overlay_ex_style() -> WINDOW_EX_STYLE {
        WS_EX_LAYERED | WS_EX_TRANSPARENT | WS_EX_TOPMOST | WS_EX_NOACTIVATE | WS_EX_TOOLWINDOW
    }

    unsafe extern "system" fn overlay_wndproc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        DefWindowProcW(hwnd, msg, wparam, lparam)
    }

    /// Full-screen, click-through popup updated with per-pixel alpha.
    pub struct LayeredWindow {
        hwnd: HWND,
        mem_dc: HDC,
        dib: HBITMAP,
        old_bitmap: HGDIOBJ,
        bits: *mut u8,
        width: u32,
        height: u32,
    }

    impl LayeredWindow {
        pub fn create(width: u32, height: u32) -> Option<Self> {
            static REGISTER_CLASS: Once = Once::new();
            let class_name = widestring("VisualTruthLoopOverlay");
            let hinstance = unsafe { GetModuleHandleW(PCWSTR::null()) }.ok()?;

            REGISTER_CLASS.call_once(|| unsafe {
                let wc = WNDCLASSW {
                    hInstance: hinstance.into(),
                    lpszClassName: PCWSTR(class_name.as_ptr()),
                    lpfnWndProc: Some(overlay_wndproc),
                    ..Default::default()
                };
                let _ = RegisterClassW(&wc);
            });

            let hwnd = unsafe {
                CreateWindowExW(
                    overlay_ex_style(),
                    PCWSTR(class_name.as_ptr()),
                    PCWSTR::null(),
                    WINDOW_STYLE(WS_POPUP.0),
                    0,
                    0,
                    width as i32,
                    height as i32,
                    None,
                    None,
                    hinstance,
                    None,
                )
                .ok()?
            };

            let mem_dc = unsafe { CreateCompatibleDC(HDC::default()) };
            if mem_dc.0.is_null() {
                unsafe {
                    let _ = DestroyWindow(hwnd);
                }
                return None;
            }

            let mut bmi = BITMAPINFO::default();
            bmi.bmiHeader = BITMAPINFOHEADER {
                biSize: mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width as i32,
                biHeight: -(height as i32),
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            };
            let mut bits: *mut core::ffi::c_void = ptr::null_mut();
            let dib = match unsafe {
                CreateDIBSection(
                    mem_dc,
                    &bmi,
                    DIB_RGB_COLORS,
                    &mut bits,
                    windows::Win32::Foundation::HANDLE::default(),
                    0,
                )
            } {
                Ok(dib) if !bits.is_null() => dib,
                _ => {
                    unsafe {
                        let _ = DeleteDC(mem_dc);
                        let _ = DestroyWindow(hwnd);
                    }
                    return None;
                }
            };
            let old_bitmap = unsafe { SelectObject(mem_dc, dib) };

            Some(Self {
                hwnd,
                mem_dc,
                dib,
                old_bitmap,
                bits: bits as *mut u8,
                width,
                height,
            })
        }

        fn byte_len(&self) -> usize {
            (self.width as usize) * (self.height as usize) * 4
        }
    }

    impl Presenter for LayeredWindow {
        fn show(&mut self) {
            self.raise();
        }

        fn present(&mut self, buffer: &RgbaImage) {
            if self.bits.is_null() || buffer.dimensions() != (self.width, self.height) {
                return;
            }
            let dib = unsafe { std::slice::from_raw_parts_mut(self.bits, self.byte_len()) };
            // Layered windows take premultiplied BGRA.
            for (dst, src) in dib.chunks_exact_mut(4).zip(buffer.as_raw().chunks_exact(4)) {
                let a = u32::from(src[3]);
                dst[0] = ((u32::from(src[2]) * a + 127) / 255) as u8;
                dst[1] = ((u32::from(src[1]) * a + 127) / 255) as u8;
                dst[2] = ((u32::from(src[0]) * a + 127) / 255) as u8;
                dst[3] = src[3];
            }
            let origin = POINT { x: 0, y: 0 };
            let size = SIZE {
                cx: self.width as i32,
                cy: self.height as i32,
            };
            let blend = BLENDFUNCTION {
                BlendOp: AC_SRC_OVER as u8,
                BlendFlags: 0,
                SourceConstantAlpha: 255,
                AlphaFormat: AC_SRC_ALPHA as u8,
            };
            unsafe {
                let _ = UpdateLayeredWindow(
                    self.hwnd,
                    HDC::default(),
                    Some(&origin),
                    Some(&size),
                    self.mem_dc,
                    Some(&origin),
                    COLORREF(0),
                    Some(&blend),
                    ULW_ALPHA,
                );
            }
        }

        fn raise(&mut self) {
            unsafe {
                let _ = SetWindowPos(
                    self.hwnd,
                    HWND_TOPMOST,
                    0,
                    0,
                    0,
                    0,
                    SWP_NOMOVE | SWP_NOSIZE | SWP_NOACTIVATE | SWP_SHOWWINDOW,
                );
            }
        }

        fn pump(&mut self) {
            unsafe {
                let mut msg = MSG::default();
                while PeekMessageW(&mut msg, HWND::default(), 0, 0, PM_REMOVE).into() {
                    let _ = TranslateMessage(&msg);
                    let _ = DispatchMessageW(&msg);
                }
            }
        }

        fn close(&mut self) {
            unsafe {
                if !self.mem_dc.0.is_null() {
                    let _ = SelectObject(self.mem_dc, self.old_bitmap);
                }
                if !self.dib.0.is_null() {
                    let _ = DeleteObject(self.dib);
                    self.dib = HBITMAP::default();
                }
                if !self.mem_dc.0.is_null() {
                    let _ = DeleteDC(self.mem_dc);
                    self.mem_dc = HDC::default();
                }
                if !self.hwnd.0.is_null() {
                    let _ = DestroyWindow(self.hwnd);
                    self.hwnd = HWND::default();
                }
            }
            self.bits = ptr::null_mut();
        }
    }

    impl Drop for LayeredWindow {
        fn drop(&mut self) {
            self.close();
        }
    }

}
