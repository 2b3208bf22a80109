// Copyright 2025-2026 CEMAXECUTER LLC

use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;

use num_complex::Complex32;

use crate::RadioSource;

// UHD C API FFI bindings (manual, minimal)

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

type UhdUsrpHandle = *mut c_void;
type UhdRxStreamerHandle = *mut c_void;
type UhdRxMetadataHandle = *mut c_void;

const UHD_TUNE_REQUEST_POLICY_AUTO: c_int = 65;

const UHD_STREAM_MODE_START_CONTINUOUS: c_int = 97;
const UHD_STREAM_MODE_STOP_CONTINUOUS: c_int = 111;

const UHD_RX_METADATA_ERROR_CODE_NONE: c_int = 0x0;
const UHD_RX_METADATA_ERROR_CODE_TIMEOUT: c_int = 0x1;
const UHD_RX_METADATA_ERROR_CODE_OVERFLOW: c_int = 0x8;

/// sc16 full scale.
const SC16_SCALE: f32 = 32768.0;

/// Seconds a single recv call may block.
const RECV_TIMEOUT: c_double = 1.0;

#[repr(C)]
struct UhdTuneRequest {
    target_freq: c_double,
    rf_freq_policy: c_int,
    rf_freq: c_double,
    dsp_freq_policy: c_int,
    dsp_freq: c_double,
    args: *mut c_char,
}

#[repr(C)]
struct UhdTuneResult {
    clipped_rf_freq: c_double,
    target_rf_freq: c_double,
    actual_rf_freq: c_double,
    target_dsp_freq: c_double,
    actual_dsp_freq: c_double,
}

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

#[repr(C)]
struct UhdStreamCmd {
    stream_mode: c_int,
    num_samps: usize,
    stream_now: bool,
    time_spec_full_secs: i64,
    time_spec_frac_secs: c_double,
}

impl UhdStreamCmd {
    fn now(stream_mode: c_int) -> Self {
        Self {
            stream_mode,
            num_samps: 0,
            stream_now: true,
            time_spec_full_secs: 0,
            time_spec_frac_secs: 0.0,
        }
    }
}

extern "C" {
    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_set_rx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_rx_rate(h: UhdUsrpHandle, chan: usize, rate_out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_rx_gain(
        h: UhdUsrpHandle,
        gain: c_double,
        chan: usize,
        gain_name: *const c_char,
    ) -> UhdError;
    fn uhd_usrp_set_rx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_get_rx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdRxStreamerHandle,
    ) -> UhdError;

    fn uhd_rx_streamer_make(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_free(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_max_num_samps(
        h: UhdRxStreamerHandle,
        max_num_samps_out: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_recv(
        h: UhdRxStreamerHandle,
        buffs: *mut *mut c_void,
        samps_per_buff: usize,
        md: *mut UhdRxMetadataHandle,
        timeout: c_double,
        one_packet: bool,
        items_recvd: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_issue_stream_cmd(
        h: UhdRxStreamerHandle,
        stream_cmd: *const UhdStreamCmd,
    ) -> UhdError;

    fn uhd_rx_metadata_make(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_free(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_error_code(
        h: UhdRxMetadataHandle,
        error_code_out: *mut c_int,
    ) -> UhdError;
}

#[derive(Debug, Clone)]
pub struct UsrpConfig {
    /// UHD device args, e.g. `serial=31F1234,num_recv_frames=1024`.
    pub device_args: String,
    pub sample_rate: f64,
    pub center_freq: f64,
    pub gain: f64,
}

/// Single-channel USRP receiver delivering `Complex32` samples.
pub struct UsrpRadio {
    usrp: UhdUsrpHandle,
    rx_handle: UhdRxStreamerHandle,
    md: UhdRxMetadataHandle,
    max_samps: usize,
    sample_rate: f64,
    center_freq: f64,
    streaming: bool,
    sc16_buf: Vec<i16>,
    overflow_count: u64,
}

// The UHD handles are only touched through &mut self.
unsafe impl Send for UsrpRadio {}

impl UsrpRadio {
    /// Open and configure the device. Streaming starts with
    /// [`RadioSource::start_streaming`].
    pub fn open(config: &UsrpConfig) -> Result<Self, String> {
        let dev_args = CString::new(config.device_args.as_str())
            .map_err(|e| format!("invalid USRP device args: {}", e))?;

        let mut radio = Self {
            usrp: ptr::null_mut(),
            rx_handle: ptr::null_mut(),
            md: ptr::null_mut(),
            max_samps: 0,
            sample_rate: config.sample_rate,
            center_freq: config.center_freq,
            streaming: false,
            sc16_buf: Vec::new(),
            overflow_count: 0,
        };

        // Any early return below drops `radio`, which frees whatever was
        // created so far.
        unsafe {
            log::info!("opening USRP ({})", config.device_args);
            check(uhd_usrp_make(&mut radio.usrp, dev_args.as_ptr()), "uhd_usrp_make")?;

            check(
                uhd_usrp_set_rx_rate(radio.usrp, config.sample_rate, 0),
                "uhd_usrp_set_rx_rate",
            )?;
            let mut actual_rate: c_double = 0.0;
            if uhd_usrp_get_rx_rate(radio.usrp, 0, &mut actual_rate) == UHD_ERROR_NONE
                && actual_rate > 0.0
            {
                radio.sample_rate = actual_rate;
            }

            check(
                uhd_usrp_set_rx_gain(radio.usrp, config.gain, 0, c"".as_ptr()),
                "uhd_usrp_set_rx_gain",
            )?;

            let mut tune_req = UhdTuneRequest {
                target_freq: config.center_freq,
                rf_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                rf_freq: 0.0,
                dsp_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
                dsp_freq: 0.0,
                args: ptr::null_mut(),
            };
            let mut tune_result = UhdTuneResult {
                clipped_rf_freq: 0.0,
                target_rf_freq: 0.0,
                actual_rf_freq: 0.0,
                target_dsp_freq: 0.0,
                actual_dsp_freq: 0.0,
            };
            check(
                uhd_usrp_set_rx_freq(radio.usrp, &mut tune_req, 0, &mut tune_result),
                "uhd_usrp_set_rx_freq",
            )?;
            log::info!(
                "USRP tuned: RF={:.1} MHz, DSP={:.1} kHz",
                tune_result.actual_rf_freq / 1e6,
                tune_result.actual_dsp_freq / 1e3,
            );

            check(uhd_rx_streamer_make(&mut radio.rx_handle), "uhd_rx_streamer_make")?;
            check(uhd_rx_metadata_make(&mut radio.md), "uhd_rx_metadata_make")?;

            let mut channel: usize = 0;
            let mut stream_args = UhdStreamArgs {
                cpu_format: c"sc16".as_ptr() as *mut c_char,
                otw_format: c"sc16".as_ptr() as *mut c_char,
                args: c"".as_ptr() as *mut c_char,
                channel_list: &mut channel,
                n_channels: 1,
            };
            check(
                uhd_usrp_get_rx_stream(radio.usrp, &mut stream_args, radio.rx_handle),
                "uhd_usrp_get_rx_stream",
            )?;

            check(
                uhd_rx_streamer_max_num_samps(radio.rx_handle, &mut radio.max_samps),
                "uhd_rx_streamer_max_num_samps",
            )?;
        }

        radio.max_samps = radio.max_samps.max(1);
        radio.sc16_buf = vec![0i16; radio.max_samps * 2];
        log::info!(
            "USRP ready: {:.3} MS/s, gain={} dB, max_num_samps={}",
            radio.sample_rate / 1e6,
            config.gain,
            radio.max_samps
        );
        Ok(radio)
    }

    fn issue(&mut self, mode: c_int) -> UhdError {
        let cmd = UhdStreamCmd::now(mode);
        unsafe { uhd_rx_streamer_issue_stream_cmd(self.rx_handle, &cmd) }
    }
}

fn check(err: UhdError, call: &str) -> Result<(), String> {
    if err == UHD_ERROR_NONE {
        Ok(())
    } else {
        Err(format!("{} failed: error {}", call, err))
    }
}

impl RadioSource for UsrpRadio {
    fn start_streaming(&mut self) -> Result<(), String> {
        if self.streaming {
            return Ok(());
        }
        check(
            self.issue(UHD_STREAM_MODE_START_CONTINUOUS),
            "uhd_rx_streamer_issue_stream_cmd",
        )?;
        self.streaming = true;
        log::info!("USRP streaming started");
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if !self.streaming {
            return;
        }
        let _ = self.issue(UHD_STREAM_MODE_STOP_CONTINUOUS);
        self.streaming = false;
        log::info!("USRP streaming stopped");
    }

    fn recv_into(&mut self, buf: &mut [Complex32]) -> Result<usize, i32> {
        let want = buf.len().min(self.max_samps);
        let mut num_rx: usize = 0;

        unsafe {
            let mut buf_ptr = self.sc16_buf.as_mut_ptr() as *mut c_void;
            let err = uhd_rx_streamer_recv(
                self.rx_handle,
                &mut buf_ptr,
                want,
                &mut self.md,
                RECV_TIMEOUT,
                false,
                &mut num_rx,
            );
            if err != UHD_ERROR_NONE {
                return Err(err);
            }

            let mut error_code: c_int = 0;
            uhd_rx_metadata_error_code(self.md, &mut error_code);
            match error_code {
                UHD_RX_METADATA_ERROR_CODE_NONE | UHD_RX_METADATA_ERROR_CODE_TIMEOUT => {}
                UHD_RX_METADATA_ERROR_CODE_OVERFLOW => self.overflow_count += 1,
                code => return Err(code),
            }
        }

        let num_rx = num_rx.min(want);
        for (dst, iq) in buf[..num_rx].iter_mut().zip(self.sc16_buf.chunks_exact(2)) {
            *dst = Complex32::new(iq[0] as f32 / SC16_SCALE, iq[1] as f32 / SC16_SCALE);
        }
        Ok(num_rx)
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn center_frequency(&self) -> f64 {
        self.center_freq
    }
}

impl Drop for UsrpRadio {
    fn drop(&mut self) {
        if !self.rx_handle.is_null() {
            self.stop_streaming();
        }
        unsafe {
            if !self.md.is_null() {
                uhd_rx_metadata_free(&mut self.md);
            }
            if !self.rx_handle.is_null() {
                uhd_rx_streamer_free(&mut self.rx_handle);
            }
            if !self.usrp.is_null() {
                uhd_usrp_free(&mut self.usrp);
            }
        }

        if self.overflow_count > 0 {
            log::warn!("USRP: {} overflows during capture", self.overflow_count);
        }
    }
}
