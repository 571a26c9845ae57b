// GStreamer H.264 encoding pipeline.
//
// Phase 4 will implement:
// - appsrc ! videoconvert ! encoder ! h264parse ! appsink pipeline
// - Hardware encoder detection (VAAPI -> NVENC -> x264)
// - Low-latency configuration (zerolatency tune, ultrafast preset)
// - EncoderConfig for resolution, framerate, bitrate
